//! Route handlers.

pub mod health;
pub mod resource;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// Fallback for paths that are not a configured resource.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
