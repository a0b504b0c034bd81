use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::Storage(StorageError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::Storage(StorageError::Duplicate(_)) => {
                StatusCode::CONFLICT
            }
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Conflict(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::Storage(StorageError::NotFound(id)) => format!("{id} not found"),
            AppError::Storage(StorageError::Duplicate(id)) => format!("{id} already exists"),
            AppError::Storage(_) => "storage unavailable".to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::AppError;
    use crate::storage::StorageError;

    #[test]
    fn storage_errors_map_to_client_statuses() {
        let duplicate = AppError::from(StorageError::Duplicate("d-1".to_string()));
        assert_eq!(duplicate.into_response().status(), StatusCode::CONFLICT);

        let missing = AppError::from(StorageError::NotFound("d-1".to_string()));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let down = AppError::from(StorageError::Database("locked".to_string()));
        assert_eq!(down.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
