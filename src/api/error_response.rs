//! JSON error responses.

use crate::error::{Error, ToHttpStatus};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// `{"error": "<message>"}` with the given status.
pub fn err_response(status: StatusCode, message: impl AsRef<str>) -> Response {
    (status, Json(json!({ "error": message.as_ref() }))).into_response()
}

/// Map a core error onto its HTTP status and JSON body.
pub fn from_error(e: &Error) -> Response {
    err_response(e.to_http_status(), e.to_string())
}
