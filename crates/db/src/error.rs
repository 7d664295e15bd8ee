use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by catalog stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("'{0}' is not a valid identifier")]
    InvalidId(String),

    /// The payload fails validation (missing required field, duplicate id, ...)
    #[error("invalid {entity}: {message}")]
    Invalid {
        entity: &'static str,
        message: String,
    },

    #[error("invalid datastore configuration: {0}")]
    Configuration(String),

    #[error("datastore error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn invalid(entity: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            entity,
            message: message.into(),
        }
    }
}
