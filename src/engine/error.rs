use crate::repository::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngagementError {
    UserNotFound(String),
    AlreadyBooked(String),
    BookingNotFound(String),
    LimitExceeded(&'static str),
    InvalidInput(&'static str),
    Storage(StorageError),
}

impl std::fmt::Display for EngagementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngagementError::UserNotFound(email) => write!(f, "user not found: {email}"),
            EngagementError::AlreadyBooked(rid) => {
                write!(f, "residency {rid} is already booked by this user")
            }
            EngagementError::BookingNotFound(rid) => write!(f, "booking not found: {rid}"),
            EngagementError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngagementError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngagementError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngagementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngagementError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for EngagementError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::MissingRecord(email) => EngagementError::UserNotFound(email),
            StorageError::CapacityExceeded => EngagementError::LimitExceeded("too many users"),
            other => EngagementError::Storage(other),
        }
    }
}
