//! HTTP error mapping
//!
//! Translates core [`KasError`] request-level failures into status codes and
//! a small JSON error body. Clients get the coarse kind and a sanitized
//! message; full detail stays in tracing and the audit trail.

use acp_kas::KasError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub struct AppError {
    error: KasError,
    correlation_id: String,
}

impl AppError {
    pub fn new(error: KasError, correlation_id: impl Into<String>) -> Self {
        Self {
            error,
            correlation_id: correlation_id.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.error {
            KasError::Authentication(_) => StatusCode::UNAUTHORIZED,
            KasError::Validation(_) => StatusCode::BAD_REQUEST,
            KasError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            // No usable backend capacity for this request
            KasError::KeyManagement(_) | KasError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    #[serde(rename = "errorKind")]
    error_kind: &'static str,
    message: String,
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error_kind: self.error.kind().as_str(),
            message: self.error.client_reason(),
            correlation_id: self.correlation_id,
        });
        (status, body).into_response()
    }
}
