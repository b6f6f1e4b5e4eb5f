// Common DTOs and the wire error envelope
//
// Every error leaves the API as {"error": {"code", "message", "details?"}}
// with the HTTP status derived from the taxonomy code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use procmine_core::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

/// Result alias for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Engine error adapted to the HTTP surface
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_argument" => StatusCode::BAD_REQUEST,
            "conflict" | "precondition_failed" | "job_in_progress" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (message, details) = match &self.0 {
            EngineError::Internal(e) => {
                let correlation_id = Uuid::now_v7();
                tracing::error!(correlation_id = %correlation_id, error = %e, "internal error");
                (
                    "internal error".to_string(),
                    Some(json!({"correlation_id": correlation_id})),
                )
            }
            EngineError::JobInProgress(job_id) => (
                self.0.to_string(),
                Some(json!({"job_id": job_id})),
            ),
            other => (other.to_string(), None),
        };
        let body = json!({
            "error": {
                "code": code,
                "message": message,
                "details": details,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Common time-window request body for mining endpoints
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Option<String>,
}

/// Parse an optional RFC-3339 query value
pub fn parse_time(value: Option<&str>, field: &str) -> ApiResult<Option<DateTime<Utc>>> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(|_| ApiError(EngineError::invalid(format!("unparsable {field}: '{raw}'")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert!(parse_time(None, "start").unwrap().is_none());
        assert!(parse_time(Some("2024-01-06T10:30:00Z"), "start").unwrap().is_some());
        assert!(parse_time(Some("yesterday"), "start").is_err());
    }
}
