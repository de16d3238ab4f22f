use thiserror::Error;

/// Main error type for the transfer engine
#[derive(Error, Debug)]
pub enum RatewatchError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Coordination cache / trigger stream errors
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Trigger channel error: {0}")]
    Channel(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Settlement service errors
    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    // Order errors
    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RatewatchError
pub type Result<T> = std::result::Result<T, RatewatchError>;

/// Failures surfaced by the settlement client once its retry policy is done
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// The service rejected the request body; retrying cannot help.
    #[error("Request body validation failed because: {details}")]
    Validation { details: String },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("Malformed settlement response: {0}")]
    MalformedResponse(String),
}

impl RatewatchError {
    /// True when the error came out of the settlement client rather than our own infrastructure.
    pub fn is_settlement(&self) -> bool {
        matches!(self, RatewatchError::Settlement(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_carries_details() {
        let err = SettlementError::Validation {
            details: "amount must be positive,asset unknown".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request body validation failed because: amount must be positive,asset unknown"
        );
        assert!(RatewatchError::from(err).is_settlement());
    }

    #[test]
    fn test_exhausted_message_names_operation() {
        let err = SettlementError::RetriesExhausted {
            operation: "getQuote",
            attempts: 3,
            last_error: "status=503".to_string(),
        };
        assert_eq!(err.to_string(), "getQuote failed after 3 attempts: status=503");
        assert!(!RatewatchError::Internal("pool closed".to_string()).is_settlement());
    }
}
