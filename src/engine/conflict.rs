use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::BookingError;

/// Does `existing` collide with the candidate range? Both are on the same room/date.
///
/// 1. existing starts inside `[start, end)`
/// 2. existing ends inside `(start, end]`
/// 3. existing covers the whole candidate
///
/// With `start < end` enforced on every record, clause 1 also catches a
/// candidate that swallows an existing booking, so this is exactly half-open overlap.
pub fn overlaps(existing: &Booking, candidate: &TimeRange) -> bool {
    let (s, e) = (existing.start_time.as_str(), existing.end_time.as_str());
    let (cs, ce) = (candidate.start.as_str(), candidate.end.as_str());
    (s >= cs && s < ce) || (e > cs && e <= ce) || (s <= cs && e >= ce)
}

/// Existing bookings on `room`/`date` that collide with `range`, skipping `exclude`.
pub fn conflicting<'a>(
    bookings: impl IntoIterator<Item = &'a Booking>,
    room: &'a str,
    date: &'a str,
    range: &'a TimeRange,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Booking> {
    bookings.into_iter().filter(move |b| {
        Some(b.id) != exclude && b.same_slot(room, date) && overlaps(b, range)
    })
}

pub(crate) fn validate_date(date: &str) -> Result<(), BookingError> {
    if date.len() != DATE_LEN || NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(BookingError::invalid(format!("date must be YYYY-MM-DD, got {date:?}")));
    }
    Ok(())
}

pub(crate) fn validate_time(field: &str, time: &str) -> Result<(), BookingError> {
    if time.len() != TIME_LEN || NaiveTime::parse_from_str(time, "%H:%M").is_err() {
        return Err(BookingError::invalid(format!("{field} must be HH:MM, got {time:?}")));
    }
    Ok(())
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), BookingError> {
    validate_time("start_time", &range.start)?;
    validate_time("end_time", &range.end)?;
    if range.start >= range.end {
        return Err(BookingError::invalid(format!(
            "start_time {} must be before end_time {}",
            range.start, range.end
        )));
    }
    Ok(())
}

fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), BookingError> {
    if value.trim().is_empty() {
        return Err(BookingError::invalid(format!("{field} must not be empty")));
    }
    if value.len() > max {
        return Err(BookingError::LimitExceeded(field));
    }
    Ok(())
}

fn validate_phone(phone: Option<&str>) -> Result<(), BookingError> {
    match phone {
        Some(p) if p.len() > MAX_PHONE_LEN => Err(BookingError::LimitExceeded("phone")),
        _ => Ok(()),
    }
}

/// Full check of a stored-shape record, used for creates and merged updates.
pub(crate) fn validate_booking(booking: &Booking) -> Result<(), BookingError> {
    validate_text("room", &booking.room, MAX_ROOM_LEN)?;
    validate_text("name", &booking.name, MAX_NAME_LEN)?;
    validate_date(&booking.date)?;
    validate_range(&booking.time_range())?;
    validate_phone(booking.phone.as_deref())
}
