//! Service-level error type.
//!
//! Wraps the module errors so request boundaries can map any failure to a
//! status code and a stable machine-readable code.

use crate::custody::CustodyError;
use crate::manifest::ManifestError;
use crate::store::StoreError;
use thiserror::Error;
use uptane_core::MetadataError;

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, DirectorError>;

impl DirectorError {
    /// HTTP status the request boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            DirectorError::Manifest(ManifestError::RobotNotFound) => 404,
            DirectorError::Manifest(_) => 400,
            DirectorError::Store(StoreError::NotFound(_)) => 404,
            DirectorError::Store(StoreError::AlreadyExists(_)) => 409,
            DirectorError::NotFound(_) => 404,
            DirectorError::Conflict(_) => 409,
            DirectorError::InvalidRequest(_) => 400,
            DirectorError::Custody(_) | DirectorError::Store(_) | DirectorError::Metadata(_) => 500,
        }
    }

    /// Stable snake_case error code.
    pub fn code(&self) -> &'static str {
        match self {
            DirectorError::Manifest(e) => e.code(),
            DirectorError::Store(StoreError::NotFound(_)) | DirectorError::NotFound(_) => "not_found",
            DirectorError::Store(StoreError::AlreadyExists(_)) | DirectorError::Conflict(_) => "conflict",
            DirectorError::InvalidRequest(_) => "invalid_request",
            DirectorError::Custody(_) | DirectorError::Store(_) | DirectorError::Metadata(_) => {
                "internal_error"
            }
        }
    }

    /// Message safe to return to a caller.
    ///
    /// Server errors can carry key ids and certificate ids in their `Display`
    /// form; those stay in the logs.
    pub fn public_message(&self) -> String {
        if self.status_code() >= 500 {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }
}
