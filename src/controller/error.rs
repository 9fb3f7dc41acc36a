//! Error types for the Config controller

use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `StorageError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Conflict persisted after {attempts} attempts writing {name}")]
    ConflictError { name: String, attempts: u32 },
}

/// How the controller reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry with exponential backoff, phase unchanged
    Transient,
    /// Wait for a spec change
    Configuration,
    /// Credentials or RBAC are wrong
    Authorization,
    /// The request would break an established identity
    InvariantViolation,
}

impl ErrorClass {
    /// Condition reason for this class
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "TransientError",
            ErrorClass::Configuration => "ConfigurationError",
            ErrorClass::Authorization => "AuthorizationError",
            ErrorClass::InvariantViolation => "InvariantViolation",
        }
    }
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => match api_err.code {
                    401 | 403 => ErrorClass::Authorization,
                    // Conflicts and throttling resolve on their own
                    409 | 429 => ErrorClass::Transient,
                    code if (400..500).contains(&code) => ErrorClass::Configuration,
                    _ => ErrorClass::Transient,
                },
                // Network and other client errors are retryable
                _ => ErrorClass::Transient,
            },
            Error::StorageError(e) => match e {
                StorageError::Transient(_) => ErrorClass::Transient,
                StorageError::Authentication(_) => ErrorClass::Authorization,
                StorageError::Configuration(_) => ErrorClass::Configuration,
                StorageError::InvariantViolation(_) => ErrorClass::InvariantViolation,
            },
            Error::ConflictError { .. } => ErrorClass::Transient,
            Error::SerializationError(_) => ErrorClass::InvariantViolation,
            Error::MissingObjectKey(_) => ErrorClass::InvariantViolation,
            Error::ValidationError(_) => ErrorClass::Configuration,
            Error::MissingCredentials(_) => ErrorClass::Configuration,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this is a 409 from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries, also the fixed delay for fatal errors
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    fn base_delay_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(32) as i32;
        self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)
    }

    /// Backoff delay for `attempt` without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs_f64(
            self.base_delay_secs(attempt)
                .min(self.max_delay.as_secs_f64()),
        )
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs = self.base_delay_secs(attempt);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Transient errors back off exponentially; everything else waits the
    /// long fixed delay for an administrator to act
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
