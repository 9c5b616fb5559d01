use ulid::Ulid;

/// Failure of the underlying booking store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store writer shut down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("This time slot is already booked. Please select another time. (conflicts with booking {0})")]
    Conflict(Ulid),
    #[error("booking {0} not found")]
    NotFound(Ulid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The overlap check could not read existing bookings.
    #[error("validation unavailable: {0}")]
    ValidationUnavailable(#[source] StoreError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        BookingError::StorageUnavailable(e)
    }
}

impl BookingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        BookingError::InvalidInput(msg.into())
    }

    /// Status an HTTP front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            BookingError::Conflict(_)
            | BookingError::InvalidInput(_)
            | BookingError::LimitExceeded(_) => 400,
            BookingError::NotFound(_) => 404,
            BookingError::ValidationUnavailable(_) | BookingError::StorageUnavailable(_) => 500,
        }
    }

    /// SQLSTATE reported over the wire protocol.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            BookingError::Conflict(_) => "23P01",
            BookingError::NotFound(_) => "P0002",
            BookingError::InvalidInput(_) => "22023",
            BookingError::LimitExceeded(_) => "54000",
            BookingError::ValidationUnavailable(_) | BookingError::StorageUnavailable(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Conflict(_) => "conflict",
            BookingError::NotFound(_) => "not_found",
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::ValidationUnavailable(_) => "validation_unavailable",
            BookingError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}
