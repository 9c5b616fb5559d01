use std::sync::Arc;

use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{validate_date, validate_range};
use super::{BookingError, BookingStore, Engine, Lookup, ReadCache, Snapshot};

impl<S: BookingStore, C: ReadCache> Engine<S, C> {
    /// Every booking, served from the read cache when it holds a snapshot.
    ///
    /// A failing cache never fails the read: the store answers instead.
    pub async fn list_all(&self) -> Result<Snapshot, BookingError> {
        let ticket = match self.cache.get() {
            Ok(Lookup::Hit(snapshot)) => {
                metrics::counter!(crate::observability::CACHE_HITS_TOTAL).increment(1);
                return Ok(snapshot);
            }
            Ok(Lookup::Miss(ticket)) => Some(ticket),
            Err(e) => {
                warn!("cache read failed, falling back to store: {e}");
                metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL).increment(1);
                None
            }
        };
        metrics::counter!(crate::observability::CACHE_MISSES_TOTAL).increment(1);

        let snapshot: Snapshot = Arc::new(self.store.find_all().await?);
        if let Some(ticket) = ticket {
            match self.cache.set(ticket, snapshot.clone()) {
                Ok(true) => {}
                Ok(false) => {
                    metrics::counter!(crate::observability::CACHE_STALE_SETS_TOTAL).increment(1);
                }
                Err(e) => {
                    warn!("cache write failed: {e}");
                    metrics::counter!(crate::observability::CACHE_ERRORS_TOTAL).increment(1);
                }
            }
        }
        Ok(snapshot)
    }

    pub async fn get(&self, id: Ulid) -> Result<Booking, BookingError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(BookingError::NotFound(id))
    }

    /// Existing bookings the candidate slot would collide with.
    pub async fn find_conflicts(
        &self,
        room: &str,
        date: &str,
        range: &TimeRange,
    ) -> Result<Vec<Booking>, BookingError> {
        validate_date(date)?;
        validate_range(range)?;
        self.store
            .find_overlapping(room, date, range, None)
            .await
            .map_err(BookingError::ValidationUnavailable)
    }

    pub async fn conflicts(
        &self,
        room: &str,
        date: &str,
        range: &TimeRange,
    ) -> Result<bool, BookingError> {
        Ok(!self.find_conflicts(room, date, range).await?.is_empty())
    }
}
