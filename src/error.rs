//! Error types for the savings-habit service

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ImpulsesError>;

#[derive(Error, Debug)]
pub enum ImpulsesError {

    // =============================
    // Domain Errors
    // =============================

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid day-of-week pattern: {0}")]
    InvalidDayPattern(String),

    #[error("User already exists: {0}")]
    DuplicateUser(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Lottery not found: {0}")]
    LotteryNotFound(Uuid),

    #[error("Lottery closed: {0}")]
    LotteryClosed(String),

    #[error("Insufficient coins: balance {balance}, required {required}")]
    InsufficientCoins { balance: i64, required: i64 },

    #[error("Insufficient savings: {0}")]
    InsufficientSavings(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

impl From<sqlx::Error> for ImpulsesError {
    fn from(err: sqlx::Error) -> Self {
        ImpulsesError::DatabaseError(err.to_string())
    }
}

impl ImpulsesError {
    /// True for errors caused by the caller rather than the backend
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ImpulsesError::InvalidInput(_)
                | ImpulsesError::InvalidDayPattern(_)
                | ImpulsesError::DuplicateUser(_)
                | ImpulsesError::UserNotFound(_)
                | ImpulsesError::LotteryNotFound(_)
                | ImpulsesError::LotteryClosed(_)
                | ImpulsesError::InsufficientCoins { .. }
                | ImpulsesError::InsufficientSavings(_)
                | ImpulsesError::UuidError(_)
        )
    }
}
