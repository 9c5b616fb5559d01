pub const MAX_ROOM_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 64;
pub const MAX_BOOKINGS: usize = 1_000_000;

/// `YYYY-MM-DD`
pub const DATE_LEN: usize = 10;
/// `HH:MM`
pub const TIME_LEN: usize = 5;
