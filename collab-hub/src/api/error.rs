use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use collab_hub_core::{ErrorKind, HubError};
use serde_json::json;
use tracing::error;

/// Error returned by every handler; renders as `{"status", "message"}`.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl ApiError {
    pub fn unauthenticated(msg: &str) -> Self {
        ApiError(HubError::Unauthenticated(msg.to_string()))
    }

    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(HubError::Storage(err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(HubError::invalid(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(HubError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (label, message) = match &self.0 {
            HubError::Storage(e) => {
                error!("internal error: {e:?}");
                ("error", "Something went wrong. Please try again.".to_string())
            }
            other => ("fail", other.to_string()),
        };
        (status, Json(json!({ "status": label, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body;

    async fn render(err: HubError) -> (StatusCode, serde_json::Value) {
        let resp = ApiError(err).into_response();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn client_errors_keep_their_message() {
        let (status, body) = render(HubError::conflict("already invited")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "fail");
        assert_eq!(body["message"], "already invited");
    }

    #[tokio::test]
    async fn storage_errors_are_generic() {
        let (status, body) = render(anyhow::anyhow!("pg: password authentication failed").into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(!body["message"].as_str().unwrap().contains("pg"));
    }
}
