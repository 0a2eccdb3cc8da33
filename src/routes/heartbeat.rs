use rocket::{post, serde::json::Json, State, http::Status};
use crate::alerts::{ResultLabel, ResultPipeline};
use crate::db::Db;
use crate::tokens::hash_token;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

// ── Heartbeat Pings (token-addressed, no auth) ──

fn resolve_token(
    db: &Db,
    token: &str,
) -> Result<(String, bool), (Status, Json<serde_json::Value>)> {
    let hash = hash_token(token);
    let conn = db.conn.lock().unwrap();
    conn.query_row(
        "SELECT id, enabled FROM monitors WHERE heartbeat_token_hash = ?1",
        params![hash],
        |row| Ok((row.get(0)?, row.get::<_, i32>(1)? != 0)),
    )
    .optional()
    .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
    .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
        "error": "Unknown heartbeat token", "code": "NOT_FOUND"
    }))))
}

fn touch_ping(db: &Db, monitor_id: &str) -> Result<(), (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    conn.execute(
        "UPDATE monitors SET last_ping_at = datetime('now'), updated_at = datetime('now') WHERE id = ?1",
        params![monitor_id],
    )
    .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;
    Ok(())
}

#[post("/heartbeat/<token>")]
pub async fn heartbeat_ping(
    token: &str,
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<ResultPipeline>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let (id, enabled) = resolve_token(db, token)?;
    touch_ping(db, &id)?;

    // Paused monitors keep their ping clock fresh but write no result
    if !enabled {
        return Ok(Json(serde_json::json!({"status": "ok", "recorded": false})));
    }

    let result = pipeline
        .process_check_result(&id, ResultLabel::Up, None, None)
        .await
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "recorded": true,
        "is_status_change": result.is_status_change
    })))
}

#[derive(serde::Deserialize)]
pub struct HeartbeatFailure {
    pub details: Option<String>,
}

#[post("/heartbeat/<token>/fail", data = "<input>")]
pub async fn heartbeat_fail(
    token: &str,
    input: Option<Json<HeartbeatFailure>>,
    db: &State<Arc<Db>>,
    pipeline: &State<Arc<ResultPipeline>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let details = input
        .and_then(|j| j.into_inner().details)
        .unwrap_or_else(|| "Failure reported by heartbeat sender".to_string());

    let (id, enabled) = resolve_token(db, token)?;
    touch_ping(db, &id)?;

    if !enabled {
        return Ok(Json(serde_json::json!({"status": "ok", "recorded": false})));
    }

    let result = pipeline
        .process_check_result(&id, ResultLabel::Down, None, Some(details))
        .await
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "recorded": true,
        "is_status_change": result.is_status_change
    })))
}
