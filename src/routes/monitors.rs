use rocket::{get, post, patch, delete, serde::json::Json, State, http::Status};
use crate::admission::Trigger;
use crate::db::Db;
use crate::dispatch::{Dispatcher, Submitted};
use crate::models::{Monitor, MonitorResult, CreateMonitor, UpdateMonitor, CreateMonitorResponse};
use crate::scheduler::{ScheduleTarget, Scheduler};
use crate::tokens::{generate_token, hash_token};
use super::{get_monitor_from_db, row_to_monitor};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

// ── Create Monitor ──

#[post("/monitors", format = "json", data = "<input>")]
pub fn create_monitor(
    input: Json<CreateMonitor>,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<CreateMonitorResponse>, (Status, Json<serde_json::Value>)> {
    let data = input.into_inner();

    if data.name.trim().is_empty() {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": "Name is required", "code": "VALIDATION_ERROR"
        }))));
    }
    if let Err(msg) = data.config.validate(&data.target) {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": msg, "code": "VALIDATION_ERROR"
        }))));
    }

    let monitor_type = data.config.kind();
    let is_heartbeat = monitor_type == "heartbeat";
    // Heartbeat monitors are ping-driven; they never get a check timer
    let frequency = if is_heartbeat { 0 } else { data.frequency_minutes };

    let id = uuid::Uuid::new_v4().to_string();
    let (token, token_hash) = if is_heartbeat {
        let t = generate_token();
        let h = hash_token(&t);
        (Some(t), Some(h))
    } else {
        (None, None)
    };

    {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes, enabled, alert_config, heartbeat_token_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                data.name.trim(),
                monitor_type,
                data.target.trim(),
                serde_json::to_string(&data.config).unwrap(),
                frequency,
                data.enabled as i32,
                data.alert_config.as_ref().map(|a| serde_json::to_string(a).unwrap()),
                token_hash,
            ],
        ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({
            "error": format!("DB error: {}", e), "code": "INTERNAL_ERROR"
        }))))?;
    }

    if data.enabled && !is_heartbeat {
        scheduler.reschedule_monitor(&id);
        scheduler.trigger_immediate(ScheduleTarget::Monitor { id: id.clone() });
    }

    let monitor = {
        let conn = db.conn.lock().unwrap();
        get_monitor_from_db(&conn, &id).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({
            "error": format!("DB error: {}", e), "code": "INTERNAL_ERROR"
        }))))?
    };

    let ping_url = token.as_ref().map(|t| format!("/api/v1/heartbeat/{}", t));
    Ok(Json(CreateMonitorResponse { monitor, heartbeat_token: token, ping_url }))
}

// ── List / Get ──

#[get("/monitors")]
pub fn list_monitors(db: &State<Arc<Db>>) -> Result<Json<Vec<Monitor>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, name, monitor_type, target, config, frequency_minutes, enabled, status, last_check_at, last_status_change_at, last_ping_at, alert_config, created_at, updated_at
         FROM monitors ORDER BY name"
    ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    let monitors = stmt.query_map([], |row| Ok(row_to_monitor(row)))
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(monitors))
}

#[get("/monitors/<id>")]
pub fn get_monitor(id: &str, db: &State<Arc<Db>>) -> Result<Json<Monitor>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let monitor = get_monitor_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({
            "error": "Monitor not found", "code": "NOT_FOUND"
        }))))?;
    Ok(Json(monitor))
}

// ── Update Monitor ──

#[patch("/monitors/<id>", format = "json", data = "<input>")]
pub fn update_monitor(
    id: &str,
    input: Json<UpdateMonitor>,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let data = input.into_inner();
    let needs_reschedule = data.frequency_minutes.is_some() || data.enabled.is_some();

    let (now_enabled, is_heartbeat) = {
        let conn = db.conn.lock().unwrap();
        let current = get_monitor_from_db(&conn, id).map_err(|_| (Status::NotFound, Json(serde_json::json!({
            "error": "Monitor not found", "code": "NOT_FOUND"
        }))))?;
        let is_heartbeat = current.monitor_type == "heartbeat";

        if let Some(ref config) = data.config {
            if config.kind() != current.monitor_type {
                return Err((Status::BadRequest, Json(serde_json::json!({
                    "error": "Monitor type cannot be changed", "code": "VALIDATION_ERROR"
                }))));
            }
        }
        let effective_target = data.target.as_deref().unwrap_or(&current.target);
        let effective_config = data.config.as_ref().unwrap_or(&current.config);
        if data.config.is_some() || data.target.is_some() {
            if let Err(msg) = effective_config.validate(effective_target) {
                return Err((Status::BadRequest, Json(serde_json::json!({
                    "error": msg, "code": "VALIDATION_ERROR"
                }))));
            }
        }
        if data.frequency_minutes.is_some() && is_heartbeat {
            return Err((Status::BadRequest, Json(serde_json::json!({
                "error": "Heartbeat monitors are ping-driven and have no check frequency",
                "code": "VALIDATION_ERROR"
            }))));
        }

        let mut updates = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref name) = data.name {
            if name.trim().is_empty() {
                return Err((Status::BadRequest, Json(serde_json::json!({
                    "error": "Name is required", "code": "VALIDATION_ERROR"
                }))));
            }
            updates.push(format!("name = ?{}", values.len() + 1));
            values.push(Box::new(name.trim().to_string()));
        }
        if let Some(ref target) = data.target {
            updates.push(format!("target = ?{}", values.len() + 1));
            values.push(Box::new(target.trim().to_string()));
        }
        if let Some(ref config) = data.config {
            updates.push(format!("config = ?{}", values.len() + 1));
            values.push(Box::new(serde_json::to_string(config).unwrap()));
        }
        if let Some(frequency) = data.frequency_minutes {
            updates.push(format!("frequency_minutes = ?{}", values.len() + 1));
            values.push(Box::new(frequency));
        }
        if let Some(enabled) = data.enabled {
            updates.push(format!("enabled = ?{}", values.len() + 1));
            values.push(Box::new(enabled as i32));
            if enabled != current.enabled {
                updates.push(format!("status = ?{}", values.len() + 1));
                values.push(Box::new(if enabled { "pending" } else { "paused" }.to_string()));
            }
        }
        if let Some(ref alert_opt) = data.alert_config {
            updates.push(format!("alert_config = ?{}", values.len() + 1));
            match alert_opt {
                Some(cfg) => values.push(Box::new(Some(serde_json::to_string(cfg).unwrap()))),
                None => values.push(Box::new(None::<String>)),
            }
        }

        if updates.is_empty() {
            return Ok(Json(serde_json::json!({"message": "No changes"})));
        }

        updates.push("updated_at = datetime('now')".to_string());
        let sql = format!("UPDATE monitors SET {} WHERE id = ?{}", updates.join(", "), values.len() + 1);
        values.push(Box::new(id.to_string()));

        let params_vec: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, params_vec.as_slice())
            .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

        (data.enabled.unwrap_or(current.enabled), is_heartbeat)
    };

    if needs_reschedule {
        scheduler.reschedule_monitor(id);
    }
    // Editing an enabled monitor also kicks off one out-of-band check
    if now_enabled && !is_heartbeat {
        scheduler.trigger_immediate(ScheduleTarget::Monitor { id: id.to_string() });
    }

    Ok(Json(serde_json::json!({"message": "Monitor updated"})))
}

// ── Delete Monitor ──

#[delete("/monitors/<id>")]
pub fn delete_monitor(
    id: &str,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let handle: Option<String> = {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
            .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
                "error": "Monitor not found", "code": "NOT_FOUND"
            }))))?
    };

    // cancel the timer before the row disappears
    if let Some(h) = handle {
        scheduler.unschedule(&h);
    }

    let conn = db.conn.lock().unwrap();
    conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok(Json(serde_json::json!({"message": "Monitor deleted"})))
}

// ── Pause / Resume ──

#[post("/monitors/<id>/pause")]
pub fn pause_monitor(
    id: &str,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let handle: Option<String> = {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
            .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
                "error": "Monitor not found", "code": "NOT_FOUND"
            }))))?
    };

    if let Some(h) = handle {
        scheduler.unschedule(&h);
    }

    let conn = db.conn.lock().unwrap();
    conn.execute(
        "UPDATE monitors SET enabled = 0, status = 'paused', scheduler_handle = NULL, updated_at = datetime('now') WHERE id = ?1",
        params![id],
    ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok(Json(serde_json::json!({"message": "Monitor paused"})))
}

#[post("/monitors/<id>/resume")]
pub fn resume_monitor(
    id: &str,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let monitor_type: String = {
        let conn = db.conn.lock().unwrap();
        let monitor_type = conn
            .query_row("SELECT monitor_type FROM monitors WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
            .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
                "error": "Monitor not found", "code": "NOT_FOUND"
            }))))?;
        conn.execute(
            "UPDATE monitors SET enabled = 1, status = 'pending', updated_at = datetime('now') WHERE id = ?1",
            params![id],
        ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;
        monitor_type
    };

    scheduler.reschedule_monitor(id);
    if monitor_type != "heartbeat" {
        scheduler.trigger_immediate(ScheduleTarget::Monitor { id: id.to_string() });
    }
    Ok(Json(serde_json::json!({"message": "Monitor resumed"})))
}

// ── Run Now ──

#[post("/monitors/<id>/run")]
pub fn run_monitor(
    id: &str,
    db: &State<Arc<Db>>,
    dispatcher: &State<Arc<Dispatcher>>,
) -> Result<(Status, Json<serde_json::Value>), (Status, Json<serde_json::Value>)> {
    let (enabled, monitor_type): (bool, String) = {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT enabled, monitor_type FROM monitors WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i32>(0)? != 0, row.get(1)?)),
        )
        .optional()
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
        .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
            "error": "Monitor not found", "code": "NOT_FOUND"
        }))))?
    };

    if !enabled {
        return Err((Status::Conflict, Json(serde_json::json!({
            "error": "Monitor is paused", "code": "MONITOR_PAUSED"
        }))));
    }
    if monitor_type == "heartbeat" {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": "Heartbeat monitors are ping-driven and cannot be checked on demand",
            "code": "VALIDATION_ERROR"
        }))));
    }

    match dispatcher.submit_check(id, Trigger::Manual) {
        Ok(Submitted::Started) => Ok((Status::Accepted, Json(serde_json::json!({"status": "started"})))),
        Ok(Submitted::Queued) => Ok((Status::Accepted, Json(serde_json::json!({"status": "queued"})))),
        Err(e) => Err((Status::TooManyRequests, Json(serde_json::json!({
            "error": "Execution capacity exhausted",
            "message": e.to_string(),
            "code": "CAPACITY"
        })))),
    }
}

// ── Result History ──

#[get("/monitors/<id>/results?<limit>&<after>")]
pub fn monitor_results(
    id: &str,
    limit: Option<u32>,
    after: Option<i64>,
    db: &State<Arc<Db>>,
) -> Result<Json<Vec<MonitorResult>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    get_monitor_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Monitor not found", "code": "NOT_FOUND"}))))?;

    let limit = limit.unwrap_or(50).min(200);
    let err_map = |e: rusqlite::Error| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()})));

    let row_to_result = |row: &rusqlite::Row| -> rusqlite::Result<MonitorResult> {
        Ok(MonitorResult {
            id: row.get(0)?,
            monitor_id: row.get(1)?,
            status: row.get(2)?,
            is_up: row.get(3)?,
            is_status_change: row.get(4)?,
            response_time_ms: row.get(5)?,
            details: row.get(6)?,
            checked_at: row.get(7)?,
            seq: row.get(8)?,
        })
    };

    let results: Vec<MonitorResult> = if let Some(after_seq) = after {
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, status, is_up, is_status_change, response_time_ms, details, checked_at, seq
             FROM monitor_results WHERE monitor_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
        ).map_err(err_map)?;
        let rows: Vec<MonitorResult> = stmt.query_map(params![id, after_seq, limit], row_to_result)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    } else {
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, status, is_up, is_status_change, response_time_ms, details, checked_at, seq
             FROM monitor_results WHERE monitor_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ).map_err(err_map)?;
        let rows: Vec<MonitorResult> = stmt.query_map(params![id, limit], row_to_result)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    Ok(Json(results))
}
