use crate::services::{
    doi::DoiError, file_keys::FileKeyError, journal::JournalError, mapping_service::MappingError,
    repository::RepositoryError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io, path::PathBuf};
use thiserror::Error;

/// Anything that aborts a deposit attempt once remote state may exist.
#[derive(Debug, Error)]
pub enum DepositError {
    #[error("a record titled `{0}` already exists")]
    TitleExists(String),
    #[error("updating the existing record `{0}` is not implemented")]
    UpdateNotImplemented(String),
    #[error("failed to read metadata {path}: {message}")]
    Metadata { path: PathBuf, message: String },
    #[error("record map has no metadata for the root record")]
    MissingMetadata,
    #[error("the deposit lock could not be acquired")]
    LockUnavailable,
    #[error(transparent)]
    FileKey(#[from] FileKeyError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("DOI registration for record `{record}` failed: {source}")]
    Doi { record: String, source: DoiError },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by the sandbox server, rendered as `{error, status}` JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        let status = match &err {
            RepositoryError::NotFound(_) | RepositoryError::FileNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RepositoryError::Rejected(_) => StatusCode::BAD_REQUEST,
            RepositoryError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_errors_map_to_statuses() {
        let not_found: AppError = RepositoryError::NotFound("x".into()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let rejected: AppError = RepositoryError::Rejected("dup".into()).into();
        assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
        assert_eq!(rejected.message, "request rejected: dup");
    }
}
