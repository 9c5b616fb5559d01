use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open time-of-day range `[start, end)` in `HH:MM`.
///
/// Both ends are fixed-width strings, so lexicographic order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One stored room reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room: String,
    pub name: String,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`
    pub start_time: String,
    /// `HH:MM`
    pub end_time: String,
    pub phone: Option<String>,
}

impl Booking {
    pub fn from_new(id: Ulid, new: NewBooking) -> Self {
        Self {
            id,
            room: new.room,
            name: new.name,
            date: new.date,
            start_time: new.start_time,
            end_time: new.end_time,
            phone: new.phone,
        }
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_time.clone(), self.end_time.clone())
    }

    pub fn same_slot(&self, room: &str, date: &str) -> bool {
        self.room == room && self.date == date
    }
}

/// Create payload: everything but the id, which the store assigns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub room: String,
    pub name: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub phone: Option<String>,
}

impl NewBooking {
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start_time.clone(), self.end_time.clone())
    }
}

/// Partial update. `phone: Some(None)` clears the phone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub room: Option<String>,
    pub name: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub phone: Option<Option<String>>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        self.room.is_none()
            && self.name.is_none()
            && self.date.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.phone.is_none()
    }

    /// Return a copy of `booking` with every present field replaced.
    pub fn merged_into(&self, booking: &Booking) -> Booking {
        let mut merged = booking.clone();
        if let Some(room) = &self.room {
            merged.room = room.clone();
        }
        if let Some(name) = &self.name {
            merged.name = name.clone();
        }
        if let Some(date) = &self.date {
            merged.date = date.clone();
        }
        if let Some(start) = &self.start_time {
            merged.start_time = start.clone();
        }
        if let Some(end) = &self.end_time {
            merged.end_time = end.clone();
        }
        if let Some(phone) = &self.phone {
            merged.phone = phone.clone();
        }
        merged
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated { booking: Booking },
    BookingUpdated { booking: Booking },
    BookingDeleted { id: Ulid },
    AllBookingsDeleted,
}
