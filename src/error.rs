use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Stable, user-facing error envelope. Never carries an internal stack trace;
/// the `message` field is meant to be read by a human in front of a client.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("all tuners busy")]
    AllBusy,

    #[error("tune failed: {0}")]
    TuneFailed(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("control plane disconnected: {0}")]
    ControlDisconnected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::AllBusy => "AllBusy",
            GatewayError::TuneFailed(_) => "TuneFailed",
            GatewayError::CaptureFailed(_) => "CaptureFailed",
            GatewayError::ControlDisconnected(_) => "ControlDisconnected",
            GatewayError::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::AllBusy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::TuneFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::CaptureFailed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ControlDisconnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            Json(ErrorEnvelope {
                kind: self.kind(),
                message: self.to_string(),
            }),
        )
            .into_response();
        if matches!(self, GatewayError::AllBusy) {
            response
                .headers_mut()
                .insert("Retry-After", "2".parse().unwrap());
        }
        response
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
