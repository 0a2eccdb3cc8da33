use rocket::{get, post, patch, delete, serde::json::Json, State, http::Status};
use crate::admission::Trigger;
use crate::db::Db;
use crate::dispatch::{Dispatcher, SubmitError};
use crate::models::{Job, CreateJob, UpdateJob, Run};
use crate::scheduler::{ScheduleTarget, Scheduler};
use super::{get_job_from_db, row_to_job};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

// ── Jobs ──

#[post("/jobs", format = "json", data = "<input>")]
pub fn create_job(
    input: Json<CreateJob>,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<Job>, (Status, Json<serde_json::Value>)> {
    let data = input.into_inner();

    if data.name.trim().is_empty() {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": "Name is required", "code": "VALIDATION_ERROR"
        }))));
    }
    if !data.payload.is_object() {
        return Err((Status::BadRequest, Json(serde_json::json!({
            "error": "Payload must be a JSON object", "code": "VALIDATION_ERROR"
        }))));
    }

    let id = uuid::Uuid::new_v4().to_string();
    {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, name, payload, frequency_minutes, enabled) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, data.name.trim(), data.payload.to_string(), data.frequency_minutes, data.enabled as i32],
        ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({
            "error": format!("DB error: {}", e), "code": "INTERNAL_ERROR"
        }))))?;
    }

    if data.enabled && data.frequency_minutes > 0 {
        scheduler.reschedule_job(&id);
        scheduler.trigger_immediate(ScheduleTarget::Job { id: id.clone() });
    }

    let conn = db.conn.lock().unwrap();
    let job = get_job_from_db(&conn, &id).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({
        "error": format!("DB error: {}", e), "code": "INTERNAL_ERROR"
    }))))?;
    Ok(Json(job))
}

#[get("/jobs")]
pub fn list_jobs(db: &State<Arc<Db>>) -> Result<Json<Vec<Job>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT id, name, payload, frequency_minutes, enabled, created_at, updated_at FROM jobs ORDER BY name"
    ).map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    let jobs = stmt.query_map([], |row| Ok(row_to_job(row)))
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(jobs))
}

#[get("/jobs/<id>")]
pub fn get_job(id: &str, db: &State<Arc<Db>>) -> Result<Json<Job>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let job = get_job_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({
            "error": "Job not found", "code": "NOT_FOUND"
        }))))?;
    Ok(Json(job))
}

#[patch("/jobs/<id>", format = "json", data = "<input>")]
pub fn update_job(
    id: &str,
    input: Json<UpdateJob>,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let data = input.into_inner();
    let needs_reschedule = data.frequency_minutes.is_some() || data.enabled.is_some();

    {
        let conn = db.conn.lock().unwrap();
        get_job_from_db(&conn, id).map_err(|_| (Status::NotFound, Json(serde_json::json!({
            "error": "Job not found", "code": "NOT_FOUND"
        }))))?;

        let err_map = |e: rusqlite::Error| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()})));

        if let Some(ref name) = data.name {
            if name.trim().is_empty() {
                return Err((Status::BadRequest, Json(serde_json::json!({
                    "error": "Name is required", "code": "VALIDATION_ERROR"
                }))));
            }
            conn.execute("UPDATE jobs SET name = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![name.trim(), id]).map_err(err_map)?;
        }
        if let Some(ref payload) = data.payload {
            if !payload.is_object() {
                return Err((Status::BadRequest, Json(serde_json::json!({
                    "error": "Payload must be a JSON object", "code": "VALIDATION_ERROR"
                }))));
            }
            conn.execute("UPDATE jobs SET payload = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![payload.to_string(), id]).map_err(err_map)?;
        }
        if let Some(frequency) = data.frequency_minutes {
            conn.execute("UPDATE jobs SET frequency_minutes = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![frequency, id]).map_err(err_map)?;
        }
        if let Some(enabled) = data.enabled {
            conn.execute("UPDATE jobs SET enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![enabled as i32, id]).map_err(err_map)?;
        }
    }

    if needs_reschedule {
        scheduler.reschedule_job(id);
    }

    Ok(Json(serde_json::json!({"message": "Job updated"})))
}

#[delete("/jobs/<id>")]
pub fn delete_job(
    id: &str,
    db: &State<Arc<Db>>,
    scheduler: &State<Arc<Scheduler>>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let handle: Option<String> = {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT scheduler_handle FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
            .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
                "error": "Job not found", "code": "NOT_FOUND"
            }))))?
    };

    if let Some(h) = handle {
        scheduler.unschedule(&h);
    }

    let conn = db.conn.lock().unwrap();
    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?;

    Ok(Json(serde_json::json!({"message": "Job deleted"})))
}

// ── Runs ──

#[derive(serde::Deserialize)]
pub struct RunJobRequest {
    pub trigger: Option<String>,
}

#[post("/jobs/<id>/run", data = "<input>")]
pub fn run_job(
    id: &str,
    input: Option<Json<RunJobRequest>>,
    db: &State<Arc<Db>>,
    dispatcher: &State<Arc<Dispatcher>>,
) -> Result<(Status, Json<Run>), (Status, Json<serde_json::Value>)> {
    let trigger = match input.and_then(|j| j.into_inner().trigger) {
        None => Trigger::Manual,
        Some(s) if s == "manual" => Trigger::Manual,
        Some(s) if s == "remote" => Trigger::Remote,
        Some(_) => {
            return Err((Status::BadRequest, Json(serde_json::json!({
                "error": "trigger must be 'manual' or 'remote'", "code": "VALIDATION_ERROR"
            }))));
        }
    };

    let (enabled, payload_str): (bool, String) = {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT enabled, payload FROM jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i32>(0)? != 0, row.get(1)?)),
        )
        .optional()
        .map_err(|e| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()}))))?
        .ok_or_else(|| (Status::NotFound, Json(serde_json::json!({
            "error": "Job not found", "code": "NOT_FOUND"
        }))))?
    };

    if !enabled {
        return Err((Status::Conflict, Json(serde_json::json!({
            "error": "Job is disabled", "code": "JOB_DISABLED"
        }))));
    }

    let payload = serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({}));
    match dispatcher.submit_run(id, payload, trigger) {
        Ok(run) => Ok((Status::Created, Json(run))),
        Err(SubmitError::Capacity(e)) => Err((Status::TooManyRequests, Json(serde_json::json!({
            "error": "Execution capacity exhausted",
            "message": e.to_string(),
            "code": "CAPACITY"
        })))),
        Err(SubmitError::Db(e)) => Err((Status::InternalServerError, Json(serde_json::json!({
            "error": format!("DB error: {}", e), "code": "INTERNAL_ERROR"
        })))),
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        job_id: row.get(1)?,
        trigger: row.get(2)?,
        state: row.get(3)?,
        queued_at: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        report_location: row.get(7)?,
        error_message: row.get(8)?,
        seq: row.get(9)?,
    })
}

#[get("/jobs/<id>/runs?<limit>&<after>")]
pub fn list_runs(
    id: &str,
    limit: Option<u32>,
    after: Option<i64>,
    db: &State<Arc<Db>>,
) -> Result<Json<Vec<Run>>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    get_job_from_db(&conn, id)
        .map_err(|_| (Status::NotFound, Json(serde_json::json!({"error": "Job not found", "code": "NOT_FOUND"}))))?;

    let limit = limit.unwrap_or(50).min(200);
    let err_map = |e: rusqlite::Error| (Status::InternalServerError, Json(serde_json::json!({"error": e.to_string()})));

    let runs: Vec<Run> = if let Some(after_seq) = after {
        let mut stmt = conn.prepare(
            "SELECT id, job_id, trigger_kind, state, queued_at, started_at, finished_at, report_location, error_message, seq
             FROM runs WHERE job_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
        ).map_err(err_map)?;
        let rows: Vec<Run> = stmt.query_map(params![id, after_seq, limit], row_to_run)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    } else {
        let mut stmt = conn.prepare(
            "SELECT id, job_id, trigger_kind, state, queued_at, started_at, finished_at, report_location, error_message, seq
             FROM runs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ).map_err(err_map)?;
        let rows: Vec<Run> = stmt.query_map(params![id, limit], row_to_run)
            .map_err(err_map)?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    Ok(Json(runs))
}

#[get("/runs/<id>")]
pub fn get_run(id: &str, db: &State<Arc<Db>>) -> Result<Json<Run>, (Status, Json<serde_json::Value>)> {
    let conn = db.conn.lock().unwrap();
    let run = conn.query_row(
        "SELECT id, job_id, trigger_kind, state, queued_at, started_at, finished_at, report_location, error_message, seq
         FROM runs WHERE id = ?1",
        params![id],
        row_to_run,
    ).map_err(|_| (Status::NotFound, Json(serde_json::json!({
        "error": "Run not found", "code": "NOT_FOUND"
    }))))?;
    Ok(Json(run))
}
