//! API errors rendered as `{"error": "..."}`

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::bacnet::BacnetError;
use crate::schedule::ScheduleError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not authenticated")]
    Unauthorized,

    #[error("incorrect username or password")]
    BadCredentials,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Bacnet(#[from] BacnetError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::BadCredentials => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Schedule(ScheduleError::Persist(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Schedule(_) => StatusCode::BAD_REQUEST,
            ApiError::Bacnet(e) => match e {
                BacnetError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
                BacnetError::MultipleDevices(_)
                | BacnetError::InvalidObjectIdentifier(_)
                | BacnetError::InvalidPropertySpecifier(_)
                | BacnetError::InvalidValue(_) => StatusCode::BAD_REQUEST,
                BacnetError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                BacnetError::NotRunning | BacnetError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
