// Route modules — one file per API domain.

mod channels;
mod heartbeat;
mod jobs;
mod monitors;
mod stream;
mod system;

// Re-export all route handlers so main.rs can use routes::* unchanged
pub use channels::{create_channel, list_channels, update_channel, delete_channel, monitor_alert_events};
pub use heartbeat::{heartbeat_ping, heartbeat_fail};
pub use jobs::{create_job, list_jobs, get_job, update_job, delete_job, run_job, list_runs, get_run};
pub use monitors::{
    create_monitor, list_monitors, get_monitor, update_monitor, delete_monitor,
    pause_monitor, resume_monitor, run_monitor, monitor_results,
};
pub use stream::{global_events, monitor_events, run_events};
pub use system::health;

use crate::models::{Job, Monitor};
use rusqlite::params;

// ── Shared Helpers ──

pub(crate) fn get_monitor_from_db(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Monitor> {
    conn.query_row(
        "SELECT id, name, monitor_type, target, config, frequency_minutes, enabled, status, last_check_at, last_status_change_at, last_ping_at, alert_config, created_at, updated_at
         FROM monitors WHERE id = ?1",
        params![id],
        |row| Ok(row_to_monitor(row)),
    )
}

pub(crate) fn row_to_monitor(row: &rusqlite::Row) -> Monitor {
    let config_str: String = row.get(4).unwrap();
    let alert_str: Option<String> = row.get(11).unwrap_or(None);
    Monitor {
        id: row.get(0).unwrap(),
        name: row.get(1).unwrap(),
        monitor_type: row.get(2).unwrap(),
        target: row.get(3).unwrap(),
        config: serde_json::from_str(&config_str).unwrap(),
        frequency_minutes: row.get(5).unwrap(),
        enabled: row.get::<_, i32>(6).unwrap() != 0,
        status: row.get(7).unwrap(),
        last_check_at: row.get(8).unwrap_or(None),
        last_status_change_at: row.get(9).unwrap_or(None),
        last_ping_at: row.get(10).unwrap_or(None),
        alert_config: alert_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(12).unwrap(),
        updated_at: row.get(13).unwrap(),
    }
}

pub(crate) fn get_job_from_db(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Job> {
    conn.query_row(
        "SELECT id, name, payload, frequency_minutes, enabled, created_at, updated_at
         FROM jobs WHERE id = ?1",
        params![id],
        |row| Ok(row_to_job(row)),
    )
}

pub(crate) fn row_to_job(row: &rusqlite::Row) -> Job {
    let payload_str: String = row.get(2).unwrap();
    Job {
        id: row.get(0).unwrap(),
        name: row.get(1).unwrap(),
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        frequency_minutes: row.get(3).unwrap(),
        enabled: row.get::<_, i32>(4).unwrap() != 0,
        created_at: row.get(5).unwrap(),
        updated_at: row.get(6).unwrap(),
    }
}
