use rocket::{get, post, patch, delete, serde::json::Json, State, http::Status};
use crate::db::Db;
use crate::models::{AlertEvent, NotificationChannel, CreateNotification, UpdateNotification};
use crate::notifications::validate_channel_config;
use super::get_monitor_from_db;
use rusqlite::params;
use std::sync::Arc;

// ── Notification Channels ──

#[post("/monitors/<id>/channels", format = "json", data = "<input>")]
pub fn create_channel(
    id: &str,
    input: Json<CreateNotification>,
    db: &State<Arc<Db>>,
) -> Result<(Status, Json<NotificationChannel>), (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    get_monitor_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Monitor not found", "code": "NOT_FOUND"}))))?;

    let data = input.into_inner();
    if data.name.trim().is_empty() {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": "Name is required", "code": "VALIDATION_ERROR"
        }))));
    }
    if let Err(msg) = validate_channel_config(&data.channel_type, &data.config) {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": msg, "code": "VALIDATION_ERROR"
        }))));
    }

    let nid = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO notification_channels (id, monitor_id, name, channel_type, config) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![nid, id, data.name.trim(), data.channel_type, data.config.to_string()],
    ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok((Status::Created, Json(NotificationChannel {
        id: nid,
        monitor_id: id.to_string(),
        name: data.name.trim().to_string(),
        channel_type: data.channel_type,
        config: data.config,
        is_enabled: true,
        created_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    })))
}

#[get("/monitors/<id>/channels")]
pub fn list_channels(
    id: &str,
    db: &State<Arc<Db>>,
) -> Result<Json<Vec<NotificationChannel>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    get_monitor_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Monitor not found", "code": "NOT_FOUND"}))))?;

    let mut stmt = conn.prepare(
        "SELECT id, monitor_id, name, channel_type, config, is_enabled, created_at FROM notification_channels WHERE monitor_id = ?1"
    ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    let channels = stmt.query_map(params![id], |row| {
        let config_str: String = row.get(4)?;
        Ok(NotificationChannel {
            id: row.get(0)?,
            monitor_id: row.get(1)?,
            name: row.get(2)?,
            channel_type: row.get(3)?,
            config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
            is_enabled: row.get(5)?,
            created_at: row.get(6)?,
        })
    }).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
    .filter_map(|r| r.ok())
    .collect();

    Ok(Json(channels))
}

#[patch("/channels/<id>", format = "json", data = "<input>")]
pub fn update_channel(
    id: &str,
    input: Json<UpdateNotification>,
    db: &State<Arc<Db>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();

    let channel_type: String = conn.query_row(
        "SELECT channel_type FROM notification_channels WHERE id = ?1",
        params![id],
        |row| row.get(0),
    ).map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Channel not found", "code": "NOT_FOUND"}))))?;

    let data = input.into_inner();
    let err_map = |e: rusqlite::Error| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()})));

    if let Some(ref name) = data.name {
        if name.trim().is_empty() {
            return Err((Status::BadRequest, Json(serde_json::json!({
                "error": "Name is required", "code": "VALIDATION_ERROR"
            }))));
        }
        conn.execute("UPDATE notification_channels SET name = ?1 WHERE id = ?2", params![name.trim(), id])
            .map_err(err_map)?;
    }
    if let Some(ref config) = data.config {
        if let Err(msg) = validate_channel_config(&channel_type, config) {
            return Err((Status::BadRequest, Json(serde_json::json!({
                "error": msg, "code": "VALIDATION_ERROR"
            }))));
        }
        conn.execute("UPDATE notification_channels SET config = ?1 WHERE id = ?2", params![config.to_string(), id])
            .map_err(err_map)?;
    }
    if let Some(enabled) = data.is_enabled {
        conn.execute("UPDATE notification_channels SET is_enabled = ?1 WHERE id = ?2", params![enabled, id])
            .map_err(err_map)?;
    }

    Ok(Json(serde_json::json!({"message": "Channel updated"})))
}

#[delete("/channels/<id>")]
pub fn delete_channel(
    id: &str,
    db: &State<Arc<Db>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let deleted = conn.execute("DELETE FROM notification_channels WHERE id = ?1", params![id])
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;
    if deleted == 0 {
        return Err((Status::NotFound, Json(serde_json::json!({
            "error": "Channel not found", "code": "NOT_FOUND"
        }))));
    }
    Ok(Json(serde_json::json!({"message": "Channel deleted"})))
}

// ── Alert History ──

#[get("/monitors/<id>/alert-events?<limit>&<after>")]
pub fn monitor_alert_events(
    id: &str,
    limit: Option<u32>,
    after: Option<i64>,
    db: &State<Arc<Db>>,
) -> Result<Json<Vec<AlertEvent>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    get_monitor_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Monitor not found", "code": "NOT_FOUND"}))))?;

    let limit = limit.unwrap_or(50).min(200);
    let err_map = |e: rusqlite::Error| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()})));

    let row_to_event = |row: &rusqlite::Row| -> rusqlite::Result<AlertEvent> {
        let providers_str: String = row.get(6)?;
        Ok(AlertEvent {
            id: row.get(0)?,
            event_type: row.get(1)?,
            target_type: row.get(2)?,
            target_id: row.get(3)?,
            severity: row.get(4)?,
            message: row.get(5)?,
            providers: serde_json::from_str(&providers_str).unwrap_or(serde_json::json!([])),
            status: row.get(7)?,
            created_at: row.get(8)?,
            seq: row.get(9)?,
        })
    };

    let events: Vec<AlertEvent> = if let Some(after_seq) = after {
        let mut stmt = conn.prepare(
            "SELECT id, event_type, target_type, target_id, severity, message, providers, status, created_at, seq
             FROM alert_events WHERE target_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
        ).map_err(err_map)?;
        let rows: Vec<AlertEvent> = stmt.query_map(params![id, after_seq, limit], row_to_event)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    } else {
        let mut stmt = conn.prepare(
            "SELECT id, event_type, target_type, target_id, severity, message, providers, status, created_at, seq
             FROM alert_events WHERE target_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ).map_err(err_map)?;
        let rows: Vec<AlertEvent> = stmt.query_map(params![id, limit], row_to_event)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    Ok(Json(events))
}
