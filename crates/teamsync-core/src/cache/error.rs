use std::sync::Arc;

use thiserror::Error;

use crate::api::ApiError;

use super::MutationKind;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] Arc<ApiError>),

    #[error("Unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl QueryError {
    pub fn user_message(&self) -> String {
        match self {
            QueryError::Fetch(e) => e.user_message(),
            QueryError::Decode(_) => crate::api::error::GENERIC_ERROR_MESSAGE.to_string(),
        }
    }
}

/// A mutation the server did not apply. The cache was left untouched.
#[derive(Error, Debug)]
#[error("{kind} failed: {message}")]
pub struct MutationError {
    pub kind: MutationKind,
    /// User-facing message extracted from the failure payload.
    pub message: String,
    #[source]
    pub source: ApiError,
}

impl MutationError {
    pub fn new(kind: MutationKind, source: ApiError) -> Self {
        Self {
            kind,
            message: source.user_message(),
            source,
        }
    }
}
