/// Centralized error types for bar synchronization and signal calculation
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    // Persistence Errors
    #[error("Bar store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Bar store query failed: {0}")]
    StoreQuery(String),

    // Provider Errors
    #[error(transparent)]
    Fetch(#[from] FetchError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Errors the caller may retry later without changing anything
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::StoreUnavailable(_) => true,
            SyncError::Fetch(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Errors that abort a whole sync run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_)
                | SyncError::StoreQuery(_)
                | SyncError::ConfigError(_)
                | SyncError::InternalError(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            SyncError::StoreUnavailable(_) => "STORE_001",
            SyncError::StoreQuery(_) => "STORE_002",
            SyncError::Fetch(FetchError::Transient(_)) => "FETCH_001",
            SyncError::Fetch(FetchError::Permanent(_)) => "FETCH_002",
            SyncError::ConfigError(_) => "CFG_001",
            SyncError::InvalidParameter(_) => "CFG_002",
            SyncError::FileError(_) => "FILE_001",
            SyncError::DeserializationError(_) => "DATA_001",
            SyncError::InternalError(_) => "INT_001",
        }
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(e: r2d2::Error) -> Self {
        SyncError::StoreUnavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure,
            ) => SyncError::StoreUnavailable(e.to_string()),
            _ => SyncError::StoreQuery(e.to_string()),
        }
    }
}

/// Failure reported by a bar fetcher adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble, rate limiting, timeouts: worth another attempt
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// Unsupported symbol/timeframe, bad request: retrying will not help
    #[error("Permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            FetchError::Transient(msg) | FetchError::Permanent(msg) => msg,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                FetchError::Permanent(e.to_string())
            }
            _ => FetchError::Transient(e.to_string()),
        }
    }
}

/// Reason a fetched bar was dropped before reaching the store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("bar belongs to {found}, expected {expected}")]
    WrongSeries { expected: String, found: String },

    #[error("timestamp {0} is not aligned to the timeframe grid")]
    Misaligned(DateTime<Utc>),

    #[error("timestamp {timestamp} does not advance past {previous}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        previous: DateTime<Utc>,
    },

    #[error("timestamp {0} outside the requested window")]
    OutsideWindow(DateTime<Utc>),

    #[error("inconsistent prices: {0}")]
    InvalidPrice(String),

    #[error("invalid volume {0}")]
    InvalidVolume(f64),
}

impl ValidationError {
    pub fn error_code(&self) -> &str {
        match self {
            ValidationError::WrongSeries { .. } => "VAL_001",
            ValidationError::Misaligned(_) => "VAL_002",
            ValidationError::OutOfOrder { .. } => "VAL_003",
            ValidationError::OutsideWindow(_) => "VAL_004",
            ValidationError::InvalidPrice(_) => "VAL_005",
            ValidationError::InvalidVolume(_) => "VAL_006",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let outage = SyncError::StoreUnavailable("pool timed out".to_string());
        assert!(outage.is_fatal());
        assert!(outage.is_recoverable());
        assert_eq!(outage.error_code(), "STORE_001");

        let transient: SyncError = FetchError::Transient("503".to_string()).into();
        assert!(!transient.is_fatal());
        assert!(transient.is_recoverable());

        let permanent: SyncError = FetchError::Permanent("unknown symbol".to_string()).into();
        assert!(!permanent.is_recoverable());
        assert_eq!(permanent.error_code(), "FETCH_002");
    }

    #[test]
    fn test_sqlite_busy_maps_to_unavailable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(SyncError::from(busy), SyncError::StoreUnavailable(_)));

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(SyncError::from(other), SyncError::StoreQuery(_)));
    }
}
