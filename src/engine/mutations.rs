use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{validate_booking, validate_date, validate_time};
use super::{BookingError, BookingStore, Engine, InsertOutcome, ReadCache, UpdateOutcome};

impl<S: BookingStore, C: ReadCache> Engine<S, C> {
    /// Validate, check for overlap and persist in one conditional insert.
    pub async fn create(&self, new: NewBooking) -> Result<Booking, BookingError> {
        let booking = Booking::from_new(Ulid::new(), new);
        validate_booking(&booking)?;

        match self.store.insert_if_free(booking).await? {
            InsertOutcome::Inserted(booking) => {
                self.invalidate_cache();
                info!(
                    id = %booking.id,
                    room = %booking.room,
                    date = %booking.date,
                    "booked {}-{}",
                    booking.start_time,
                    booking.end_time
                );
                Ok(booking)
            }
            InsertOutcome::Conflict(existing) => {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                debug!(%existing, "create rejected: slot taken");
                Err(BookingError::Conflict(existing))
            }
            InsertOutcome::Full => Err(BookingError::LimitExceeded("too many bookings")),
        }
    }

    pub async fn update(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, BookingError> {
        if patch.is_empty() {
            return Err(BookingError::invalid("no data provided for update"));
        }
        if let Some(date) = &patch.date {
            validate_date(date)?;
        }
        if let Some(start) = &patch.start_time {
            validate_time("start_time", start)?;
        }
        if let Some(end) = &patch.end_time {
            validate_time("end_time", end)?;
        }

        match self
            .store
            .update_by_id(id, &patch, self.config.revalidate_updates)
            .await?
        {
            UpdateOutcome::Updated(booking) => {
                self.invalidate_cache();
                info!(%id, "updated booking");
                Ok(booking)
            }
            UpdateOutcome::NotFound => Err(BookingError::NotFound(id)),
            UpdateOutcome::Conflict(existing) => {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                Err(BookingError::Conflict(existing))
            }
            UpdateOutcome::Rejected(e) => Err(e),
        }
    }

    pub async fn delete_one(&self, id: Ulid) -> Result<(), BookingError> {
        if self.store.delete_by_id(id).await? == 0 {
            return Err(BookingError::NotFound(id));
        }
        self.invalidate_cache();
        info!(%id, "deleted booking");
        Ok(())
    }

    /// Returns how many bookings were removed.
    pub async fn delete_all(&self) -> Result<usize, BookingError> {
        let removed = self.store.delete_all().await?;
        self.invalidate_cache();
        info!(removed, "deleted all bookings");
        Ok(removed)
    }
}
