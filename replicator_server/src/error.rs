use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("admin token required")]
    Unauthorized,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Core(#[from] replicator_core::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Unauthorized => ErrorBody {
                error: "unauthorized".to_string(),
                message: None,
            },
            ApiError::InvalidInput(msg) => ErrorBody {
                error: "invalid_input".to_string(),
                message: Some(msg.clone()),
            },
            // Store failures keep their detail in the logs only.
            ApiError::Core(
                err @ (replicator_core::Error::Store { .. } | replicator_core::Error::StoreMessage(_)),
            ) => ErrorBody {
                error: err.kind().to_string(),
                message: None,
            },
            ApiError::Core(err) => ErrorBody {
                error: err.kind().to_string(),
                message: Some(err.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_status() {
        let err = ApiError::from(replicator_core::Error::DependencyMissing("parent".into()));
        assert_eq!(err.status_code(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(err.body().error, "dependency_missing");
    }

    #[test]
    fn store_detail_is_hidden() {
        let err = ApiError::from(replicator_core::Error::StoreMessage("pool timed out".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.body().message.is_none());
    }
}
