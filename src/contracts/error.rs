use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cannot reverse order {order_no}: the {window_secs}s reversal window has passed")]
    ReversalWindowElapsed { order_no: String, window_secs: u64 },

    #[error("Order number error: {0}")]
    OrderNumber(#[from] GenerationFailure),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TrackerError {
    /// Returns true if repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackerError::OrderNumber(e) => e.is_retryable(),
            TrackerError::Storage(StorageError::Conflict(_)) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint or a row lock could not be satisfied.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match e.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                StorageError::Conflict(e.to_string())
            }
            _ => StorageError::RocksDb(e.to_string()),
        }
    }
}

/// The order counter could not be advanced. The counter is unchanged.
#[derive(Error, Debug)]
pub enum GenerationFailure {
    #[error("Timed out waiting for the order counter lock: {0}")]
    LockTimeout(String),

    #[error("Conflicting writer on the order counter: {0}")]
    Conflict(String),

    #[error("Storage fault while allocating order number: {0}")]
    Storage(String),

    #[error("Order counter holds an unreadable value: {0}")]
    CorruptCounter(String),

    #[error("Order counter overflow")]
    Overflow,
}

impl GenerationFailure {
    /// Returns true if the failure came from contention or a transient fault.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationFailure::LockTimeout(_)
                | GenerationFailure::Conflict(_)
                | GenerationFailure::Storage(_)
        )
    }
}

impl From<rocksdb::Error> for GenerationFailure {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::TimedOut => GenerationFailure::LockTimeout(e.to_string()),
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain => {
                GenerationFailure::Conflict(e.to_string())
            }
            _ => GenerationFailure::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_is_retryable() {
        assert!(GenerationFailure::LockTimeout("key".into()).is_retryable());
        assert!(GenerationFailure::Conflict("key".into()).is_retryable());
        assert!(!GenerationFailure::Overflow.is_retryable());
        assert!(!GenerationFailure::CorruptCounter("3 bytes".into()).is_retryable());
    }

    #[test]
    fn tracker_error_inherits_retryability() {
        let err = TrackerError::from(GenerationFailure::LockTimeout("key".into()));
        assert!(err.is_retryable());

        let err = TrackerError::Forbidden("nurse".into());
        assert!(!err.is_retryable());
    }
}
