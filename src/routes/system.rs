use rocket::{get, serde::json::Json};

// ── Health ──

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "pulsekeeper",
        "status": "ok",
        "version": "0.1.0"
    }))
}
