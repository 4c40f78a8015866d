/// Domain-specific error types for facegate
///
/// Every component boundary speaks this enum. The worker's retry policy is
/// driven by the terminal/transient split: face-content problems are terminal,
/// infrastructure problems are retried via requeue.

#[derive(Debug, thiserror::Error)]
pub enum FacegateError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Store / blob / network failures. Retryable.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Memory or CPU gating tripped; the caller should back off.
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Face-content rejection. Terminal: retrying cannot change the outcome.
    #[error("{0}")]
    Domain(#[from] DomainError),
}

/// The face-content reasons an enrollment is rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DomainError {
    #[error("No faces found in any image")]
    NoFaces,

    #[error("Different persons detected in {first} and {second} images")]
    PoseMismatch { first: String, second: String },

    #[error("Duplicate of subject {duplicate_of}")]
    Duplicate { duplicate_of: String },

    #[error("Subject {0} is blacklisted")]
    Blacklisted(String),
}

impl From<sqlx::Error> for FacegateError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => FacegateError::NotFound("row not found".to_string()),
            other => FacegateError::Transient(other.to_string()),
        }
    }
}

impl FacegateError {
    /// Helper to create validation errors with field names
    pub fn validation(field: &str, message: &str) -> Self {
        FacegateError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }

    /// True for errors the worker must not retry (the job outcome is final).
    pub fn is_terminal(&self) -> bool {
        matches!(self, FacegateError::Domain(_) | FacegateError::Validation { .. })
    }

    /// True for errors the worker converts into a requeue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FacegateError::Transient(_) | FacegateError::ResourceExhausted(_)
        )
    }
}
