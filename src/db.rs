use rusqlite::{Connection, Result};
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let db = Db { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("
            CREATE TABLE IF NOT EXISTS monitors (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                monitor_type TEXT NOT NULL,
                target TEXT NOT NULL DEFAULT '',
                config TEXT NOT NULL DEFAULT '{}',
                frequency_minutes INTEGER NOT NULL DEFAULT 5,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                last_check_at TEXT,
                last_status_change_at TEXT,
                last_ping_at TEXT,
                alert_config TEXT,
                scheduler_handle TEXT,
                heartbeat_token_hash TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_monitors_token ON monitors(heartbeat_token_hash);

            CREATE TABLE IF NOT EXISTS monitor_results (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                is_up INTEGER NOT NULL,
                is_status_change INTEGER NOT NULL DEFAULT 0,
                response_time_ms INTEGER,
                details TEXT,
                checked_at TEXT NOT NULL DEFAULT (datetime('now')),
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_monitor ON monitor_results(monitor_id, seq DESC);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                frequency_minutes INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                scheduler_handle TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                trigger_kind TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'waiting',
                queued_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                finished_at TEXT,
                report_location TEXT,
                error_message TEXT,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_job ON runs(job_id, seq DESC);

            CREATE TABLE IF NOT EXISTS alert_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                providers TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_events_target ON alert_events(target_id, seq DESC);

            CREATE TABLE IF NOT EXISTS notification_channels (
                id TEXT PRIMARY KEY,
                monitor_id TEXT NOT NULL REFERENCES monitors(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                config TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_channels_monitor ON notification_channels(monitor_id);
        ")?;
        Ok(())
    }
}
