use thiserror::Error;

/// An inbound payload that does not have the required shape.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("\"{field}\" is required")]
    MissingField { field: &'static str },
    #[error("\"{field}\" is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("malformed payload: {reason}")]
    Malformed { reason: String },
}

/// A store collaborator failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{store} store unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("{store} store has no entry for {key}")]
    NotFound { store: &'static str, key: String },
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("application not found: {app_name}")]
    ApplicationNotFound { app_name: String },
}
