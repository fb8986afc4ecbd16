//! Wire error format: `{ "messages": [string...], "code": int }`, `code`
//! equal to the HTTP status (§6).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reflecta_core::Error;
use serde_json::json;

pub fn error_response(err: &Error) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({ "messages": err.messages(), "code": err.status() });
    (status, Json(body)).into_response()
}
