//! HTTP endpoints for hub operations other than the WebSocket itself.

use actix_web::{route, web::Json, Result};
use log::info;
use serde_json::{json, Value};

/// Health check endpoint for monitoring server status.
#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    info!("Healthy");
    Ok(Json(json!({
        "healthy": true,
    })))
}
