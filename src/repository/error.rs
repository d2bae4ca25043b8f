/// Failure inside a `UserRepository`. Opaque to callers above the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record under this email.
    MissingRecord(String),
    /// A record under this email already exists.
    DuplicateKey(String),
    /// The table is at its user cap.
    CapacityExceeded,
    Wal(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::MissingRecord(email) => write!(f, "no user record for {email}"),
            StorageError::DuplicateKey(email) => write!(f, "user record already exists: {email}"),
            StorageError::CapacityExceeded => write!(f, "user table is full"),
            StorageError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}
