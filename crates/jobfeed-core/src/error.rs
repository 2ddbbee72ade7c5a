use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for jobfeed.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid configuration detected at startup or on a request boundary.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The source rejected our credentials.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// The source asked us to slow down.
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Network/connection error talking to the source.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The source answered with something we could not interpret.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A single record failed validation.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The message bus could not be reached or did not acknowledge.
    #[error("Message bus unavailable: {0}")]
    BusUnavailable(String),

    /// The message bus refused a message for good.
    #[error("Message rejected by bus: {0}")]
    MessageRejected(String),

    /// The poller has hit a fatal source error and refuses further cycles.
    #[error("Poller faulted: {0}")]
    PollerFaulted(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Coarse error taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abort at startup (or on first sight of bad credentials).
    FatalConfig,
    /// Transient source failure. Retried with backoff, never aborts.
    SourceUnavailable,
    /// Transient bus failure. Aborts only after sustained failure.
    BusUnavailable,
    /// A bad page or record. Dropped and logged, never aborts.
    DataQuality,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ConfigError(_) | AppError::AuthError(_) | AppError::PollerFaulted(_) => {
                ErrorKind::FatalConfig
            }
            AppError::RateLimitExceeded { .. }
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::Generic(_) => ErrorKind::SourceUnavailable,
            AppError::BusUnavailable(_) => ErrorKind::BusUnavailable,
            AppError::MalformedResponse(_)
            | AppError::InvalidRecord(_)
            | AppError::SerializationError(_)
            | AppError::MessageRejected(_) => ErrorKind::DataQuality,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded { .. }
                | AppError::BusUnavailable(_)
        )
    }

    /// Returns true if this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalConfig
    }

    /// Returns true if this error should trip the bus circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(self, AppError::BusUnavailable(_) | AppError::Timeout(_))
    }

    /// Process exit code used when this error escalates out of the supervisor.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::AuthError(_) | AppError::PollerFaulted(_) => 3,
            AppError::ConfigError(_) => 2,
            AppError::BusUnavailable(_) => 4,
            _ => 1,
        }
    }
}
