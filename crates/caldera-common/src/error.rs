//! Error types shared across the Caldera core

use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the Caldera core
#[derive(Debug, Error)]
pub enum Error {
    /// The target entity (user, session, billing row, template) does not exist
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Uniqueness or state-transition violation
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Balance too low for the requested deduction
    #[error("Insufficient credits: available {available}, required {required}")]
    InsufficientCredits {
        available: Decimal,
        required: Decimal,
    },

    /// Per-tier cap on storage resources reached
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Backend call failed transiently
    #[error("Provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// Execute exceeded the caller-provided deadline
    #[error("Operation timed out")]
    Timeout,

    /// Malformed request, unknown provider, unknown template
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Schema constraint rejected the write
    #[error("Constraint violation: {message}")]
    ConstraintViolation { message: String },

    /// Database error with operation context
    #[error("Database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Billing state does not permit the operation
    #[error("No active billing for session {session_id}")]
    BillingNotActive { session_id: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
        }
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Error::ProviderUnavailable {
            message: message.into(),
        }
    }

    pub fn database(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Get error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "CALDERA_NOT_FOUND",
            Error::Conflict { .. } => "CALDERA_CONFLICT",
            Error::InsufficientCredits { .. } => "CALDERA_INSUFFICIENT_CREDITS",
            Error::QuotaExceeded { .. } => "CALDERA_QUOTA_EXCEEDED",
            Error::ProviderUnavailable { .. } => "CALDERA_PROVIDER_UNAVAILABLE",
            Error::Timeout => "CALDERA_TIMEOUT",
            Error::InvalidInput { .. } => "CALDERA_INVALID_INPUT",
            Error::ConstraintViolation { .. } => "CALDERA_CONSTRAINT_VIOLATION",
            Error::Database { .. } => "CALDERA_DATABASE_ERROR",
            Error::BillingNotActive { .. } => "CALDERA_BILLING_NOT_ACTIVE",
            Error::Config { .. } => "CALDERA_CONFIG_ERROR",
            Error::Internal { .. } => "CALDERA_INTERNAL_ERROR",
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderUnavailable { .. } | Error::Timeout | Error::Database { .. }
        )
    }

    /// Check if error is a client error
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::Conflict { .. }
                | Error::InsufficientCredits { .. }
                | Error::QuotaExceeded { .. }
                | Error::InvalidInput { .. }
        )
    }
}
