use crate::admission::Trigger;
use crate::db::Db;
use crate::dispatch::{Dispatcher, SubmitError};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

#[derive(Debug, Clone)]
pub enum ScheduleTarget {
    Monitor { id: String },
    Job { id: String },
}

impl ScheduleTarget {
    fn id(&self) -> &str {
        match self {
            ScheduleTarget::Monitor { id } | ScheduleTarget::Job { id } => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ScheduleTarget::Monitor { .. } => "monitor",
            ScheduleTarget::Job { .. } => "job",
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }
}

enum Tick {
    Ok,
    /// Admission rejected the task; the next tick retries naturally.
    Capacity,
    /// Target deleted or disabled behind our back; the schedule retires itself.
    Gone,
    Error(String),
}

/// One recurring tokio timer per enabled monitor/job, registered under an
/// opaque handle id. The registry is keyed by target, and registering a
/// schedule displaces and aborts any previous timer for the same target in
/// one locked step; concurrent reschedules always collapse to a single
/// live handle.
pub struct Scheduler {
    db: Arc<Db>,
    dispatcher: Arc<Dispatcher>,
    retry_limit: u32,
    handles: Mutex<HashMap<String, (String, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(db: Arc<Db>, dispatcher: Arc<Dispatcher>, retry_limit: u32) -> Self {
        Scheduler { db, dispatcher, retry_limit, handles: Mutex::new(HashMap::new()) }
    }

    /// Register a recurring schedule and return its handle id, displacing
    /// any previous schedule for the same target. The first tick lands one
    /// full period out; creation-time immediate checks go through
    /// `trigger_immediate` instead.
    pub fn schedule(self: &Arc<Self>, target: ScheduleTarget, frequency_minutes: u32) -> String {
        let handle_id = uuid::Uuid::new_v4().to_string();
        let key = target.key();
        let this = self.clone();
        let my_handle = handle_id.clone();
        let period = Duration::from_secs(frequency_minutes as u64 * 60);

        let join = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            let mut consecutive_errors: u32 = 0;
            loop {
                timer.tick().await;
                match this.tick(&target).await {
                    Tick::Ok => consecutive_errors = 0,
                    Tick::Capacity => {}
                    Tick::Gone => {
                        this.release(&my_handle, &target);
                        break;
                    }
                    Tick::Error(msg) => {
                        consecutive_errors += 1;
                        eprintln!(
                            "⚠️  Schedule tick failed for {} {} ({}/{}): {}",
                            target.kind(),
                            target.id(),
                            consecutive_errors,
                            this.retry_limit,
                            msg
                        );
                        if consecutive_errors >= this.retry_limit {
                            eprintln!(
                                "❌ Abandoning schedule for {} {} after {} consecutive failures",
                                target.kind(),
                                target.id(),
                                consecutive_errors
                            );
                            this.release(&my_handle, &target);
                            break;
                        }
                    }
                }
            }
        });

        if let Some((_, old)) = self.handles.lock().unwrap().insert(key, (handle_id.clone(), join)) {
            old.abort();
        }
        handle_id
    }

    async fn tick(&self, target: &ScheduleTarget) -> Tick {
        match target {
            ScheduleTarget::Monitor { id } => {
                let enabled: Option<bool> = {
                    let conn = self.db.conn.lock().unwrap();
                    match conn
                        .query_row(
                            "SELECT enabled FROM monitors WHERE id = ?1",
                            params![id],
                            |row| Ok(row.get::<_, i32>(0)? != 0),
                        )
                        .optional()
                    {
                        Ok(v) => v,
                        Err(e) => return Tick::Error(e.to_string()),
                    }
                };
                match enabled {
                    None | Some(false) => return Tick::Gone,
                    Some(true) => {}
                }
                match self.dispatcher.submit_check(id, Trigger::Schedule) {
                    Ok(_) => Tick::Ok,
                    Err(cap) => {
                        println!("⚠️  Scheduled check for {} skipped: {}", id, cap);
                        Tick::Capacity
                    }
                }
            }
            ScheduleTarget::Job { id } => {
                let row: Option<(bool, String)> = {
                    let conn = self.db.conn.lock().unwrap();
                    match conn
                        .query_row(
                            "SELECT enabled, payload FROM jobs WHERE id = ?1",
                            params![id],
                            |row| Ok((row.get::<_, i32>(0)? != 0, row.get(1)?)),
                        )
                        .optional()
                    {
                        Ok(v) => v,
                        Err(e) => return Tick::Error(e.to_string()),
                    }
                };
                let payload = match row {
                    None | Some((false, _)) => return Tick::Gone,
                    Some((true, payload_str)) => {
                        serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({}))
                    }
                };
                match self.dispatcher.submit_run(id, payload, Trigger::Schedule) {
                    Ok(_) => Tick::Ok,
                    // The rejected run is already marked failed by the dispatcher
                    Err(SubmitError::Capacity(cap)) => {
                        println!("⚠️  Scheduled run for {} rejected: {}", id, cap);
                        Tick::Capacity
                    }
                    Err(SubmitError::Db(e)) => Tick::Error(e.to_string()),
                }
            }
        }
    }

    /// Cancel a schedule by handle id. Unknown or stale handles are a no-op,
    /// so a caller holding a handle that a newer schedule already displaced
    /// cannot cancel the replacement.
    pub fn unschedule(&self, handle_id: &str) {
        let mut handles = self.handles.lock().unwrap();
        let key = handles
            .iter()
            .find(|(_, (registered, _))| registered.as_str() == handle_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = key {
            if let Some((_, join)) = handles.remove(&key) {
                join.abort();
            }
        }
    }

    /// Cancel whatever schedule a target currently has, if any.
    fn clear_target(&self, target: &ScheduleTarget) {
        if let Some((_, join)) = self.handles.lock().unwrap().remove(&target.key()) {
            join.abort();
        }
    }

    /// Drop our registry entry and clear the persisted handle, but only if
    /// each still points at us (a newer schedule may have replaced them).
    fn release(&self, handle_id: &str, target: &ScheduleTarget) {
        let key = target.key();
        {
            let mut handles = self.handles.lock().unwrap();
            if handles.get(&key).map(|(registered, _)| registered.as_str()) == Some(handle_id) {
                handles.remove(&key);
            }
        }
        let table = match target {
            ScheduleTarget::Monitor { .. } => "monitors",
            ScheduleTarget::Job { .. } => "jobs",
        };
        let conn = self.db.conn.lock().unwrap();
        let _ = conn.execute(
            &format!("UPDATE {} SET scheduler_handle = NULL WHERE id = ?1 AND scheduler_handle = ?2", table),
            params![target.id(), handle_id],
        );
    }

    /// Re-derive a monitor's schedule from its current row and persist the
    /// resulting handle. Registration displaces any previous timer, so two
    /// overlapping reschedules of the same monitor still leave exactly one.
    /// Heartbeat monitors never get a timer; the overdue scanner is their
    /// clock.
    pub fn reschedule_monitor(self: &Arc<Self>, monitor_id: &str) {
        let info: Option<(bool, u32, String)> = {
            let conn = self.db.conn.lock().unwrap();
            conn.query_row(
                "SELECT enabled, frequency_minutes, monitor_type FROM monitors WHERE id = ?1",
                params![monitor_id],
                |row| Ok((row.get::<_, i32>(0)? != 0, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                eprintln!("⚠️  Reschedule lookup failed for monitor {}: {}", monitor_id, e);
                None
            })
        };
        let Some((enabled, frequency, monitor_type)) = info else { return };

        let target = ScheduleTarget::Monitor { id: monitor_id.to_string() };
        let new_handle = if enabled && frequency > 0 && monitor_type != "heartbeat" {
            Some(self.schedule(target, frequency))
        } else {
            self.clear_target(&target);
            None
        };

        let conn = self.db.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "UPDATE monitors SET scheduler_handle = ?1 WHERE id = ?2",
            params![new_handle, monitor_id],
        ) {
            eprintln!("⚠️  Failed to persist schedule handle for monitor {}: {}", monitor_id, e);
        }
    }

    pub fn reschedule_job(self: &Arc<Self>, job_id: &str) {
        let info: Option<(bool, u32)> = {
            let conn = self.db.conn.lock().unwrap();
            conn.query_row(
                "SELECT enabled, frequency_minutes FROM jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get::<_, i32>(0)? != 0, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                eprintln!("⚠️  Reschedule lookup failed for job {}: {}", job_id, e);
                None
            })
        };
        let Some((enabled, frequency)) = info else { return };

        let target = ScheduleTarget::Job { id: job_id.to_string() };
        let new_handle = if enabled && frequency > 0 {
            Some(self.schedule(target, frequency))
        } else {
            self.clear_target(&target);
            None
        };

        let conn = self.db.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "UPDATE jobs SET scheduler_handle = ?1 WHERE id = ?2",
            params![new_handle, job_id],
        ) {
            eprintln!("⚠️  Failed to persist schedule handle for job {}: {}", job_id, e);
        }
    }

    /// Kick off an out-of-band first execution. Failures are logged and
    /// never propagate to the caller.
    pub fn trigger_immediate(&self, target: ScheduleTarget) {
        match target {
            ScheduleTarget::Monitor { id } => {
                if let Err(e) = self.dispatcher.submit_check(&id, Trigger::Schedule) {
                    println!("⚠️  Immediate check for {} not started: {}", id, e);
                }
            }
            ScheduleTarget::Job { id } => {
                let payload: Option<String> = {
                    let conn = self.db.conn.lock().unwrap();
                    conn.query_row("SELECT payload FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
                        .optional()
                        .unwrap_or(None)
                };
                let Some(payload_str) = payload else { return };
                let payload = serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({}));
                if let Err(e) = self.dispatcher.submit_run(&id, payload, Trigger::Schedule) {
                    println!("⚠️  Immediate run for {} not started: {}", id, e);
                }
            }
        }
    }

    /// Rebuild every schedule from the database at liftoff. Stale persisted
    /// handles from a previous process are replaced wholesale.
    pub fn restore_all(self: &Arc<Self>) {
        let monitors: Vec<(String, u32)> = {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt = match conn.prepare(
                "SELECT id, frequency_minutes FROM monitors
                 WHERE enabled = 1 AND frequency_minutes > 0 AND monitor_type != 'heartbeat'",
            ) {
                Ok(s) => s,
                Err(_) => return,
            };
            let rows = match stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))) {
                Ok(mapped) => mapped.filter_map(|r| r.ok()).collect(),
                Err(_) => Vec::new(),
            };
            rows
        };
        let jobs: Vec<(String, u32)> = {
            let conn = self.db.conn.lock().unwrap();
            let mut stmt = match conn
                .prepare("SELECT id, frequency_minutes FROM jobs WHERE enabled = 1 AND frequency_minutes > 0")
            {
                Ok(s) => s,
                Err(_) => return,
            };
            let rows = match stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))) {
                Ok(mapped) => mapped.filter_map(|r| r.ok()).collect(),
                Err(_) => Vec::new(),
            };
            rows
        };

        let (n_monitors, n_jobs) = (monitors.len(), jobs.len());
        for (id, frequency) in monitors {
            let handle = self.schedule(ScheduleTarget::Monitor { id: id.clone() }, frequency);
            let conn = self.db.conn.lock().unwrap();
            let _ = conn.execute(
                "UPDATE monitors SET scheduler_handle = ?1 WHERE id = ?2",
                params![handle, id],
            );
        }
        for (id, frequency) in jobs {
            let handle = self.schedule(ScheduleTarget::Job { id: id.clone() }, frequency);
            let conn = self.db.conn.lock().unwrap();
            let _ = conn.execute("UPDATE jobs SET scheduler_handle = ?1 WHERE id = ?2", params![handle, id]);
        }
        println!("🚀 Restored {} monitor schedules and {} job schedules", n_monitors, n_jobs);
    }

    pub fn active_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionQueue;
    use crate::alerts::ResultPipeline;
    use crate::publisher::EventBroadcaster;
    use crate::worker::{CheckOutcome, CheckSpec, ScriptOutcome, Worker, WorkerError};
    use async_trait::async_trait;

    struct IdleWorker;

    #[async_trait]
    impl Worker for IdleWorker {
        async fn execute_check(&self, _spec: &CheckSpec) -> Result<CheckOutcome, WorkerError> {
            Ok(CheckOutcome { success: true, response_time_ms: Some(1), details: None })
        }
        async fn execute_script(
            &self,
            _job_id: &str,
            _run_id: &str,
            _payload: &serde_json::Value,
        ) -> Result<ScriptOutcome, WorkerError> {
            Ok(ScriptOutcome { success: true, report_location: None, error_details: None })
        }
    }

    fn test_scheduler(path: &str) -> (Arc<Db>, Arc<Scheduler>) {
        let db = Arc::new(Db::new(path).unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let pipeline = Arc::new(ResultPipeline::new(db.clone(), broadcaster.clone(), reqwest::Client::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            Arc::new(IdleWorker),
            pipeline,
            AdmissionQueue::new(4, 4),
            broadcaster,
        ));
        let scheduler = Arc::new(Scheduler::new(db.clone(), dispatcher, 5));
        (db, scheduler)
    }

    #[tokio::test]
    async fn double_unschedule_is_a_noop() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (_db, scheduler) = test_scheduler(&path);
        let handle = scheduler.schedule(ScheduleTarget::Monitor { id: "m1".into() }, 5);
        assert_eq!(scheduler.active_handles(), 1);
        scheduler.unschedule(&handle);
        assert_eq!(scheduler.active_handles(), 0);
        scheduler.unschedule(&handle);
        assert_eq!(scheduler.active_handles(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reschedule_replaces_the_handle() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (db, scheduler) = test_scheduler(&path);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes)
                 VALUES ('m1', 'api', 'http', 'https://x.test', '{\"type\":\"http\"}', 5)",
                [],
            )
            .unwrap();
        }

        scheduler.reschedule_monitor("m1");
        assert_eq!(scheduler.active_handles(), 1);
        let first: Option<String> = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = 'm1'", [], |r| r.get(0)).unwrap()
        };
        assert!(first.is_some());

        // frequency change: 5 → 15, still exactly one live handle
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE monitors SET frequency_minutes = 15 WHERE id = 'm1'", []).unwrap();
        }
        scheduler.reschedule_monitor("m1");
        assert_eq!(scheduler.active_handles(), 1);
        let second: Option<String> = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = 'm1'", [], |r| r.get(0)).unwrap()
        };
        assert!(second.is_some());
        assert_ne!(first, second);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn disabled_monitors_lose_their_schedule() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (db, scheduler) = test_scheduler(&path);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes)
                 VALUES ('m1', 'api', 'http', 'https://x.test', '{\"type\":\"http\"}', 5)",
                [],
            )
            .unwrap();
        }
        scheduler.reschedule_monitor("m1");
        assert_eq!(scheduler.active_handles(), 1);

        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE monitors SET enabled = 0 WHERE id = 'm1'", []).unwrap();
        }
        scheduler.reschedule_monitor("m1");
        assert_eq!(scheduler.active_handles(), 0);
        let handle: Option<String> = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = 'm1'", [], |r| r.get(0)).unwrap()
        };
        assert!(handle.is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn heartbeat_monitors_are_never_scheduled() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (db, scheduler) = test_scheduler(&path);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes)
                 VALUES ('hb', 'cron', 'heartbeat', '', '{\"type\":\"heartbeat\",\"expected_interval_minutes\":60}', 5)",
                [],
            )
            .unwrap();
        }
        scheduler.reschedule_monitor("hb");
        assert_eq!(scheduler.active_handles(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn racing_reschedules_keep_a_single_handle() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (db, scheduler) = test_scheduler(&path);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes)
                 VALUES ('m1', 'api', 'http', 'https://x.test', '{\"type\":\"http\"}', 5)",
                [],
            )
            .unwrap();
        }
        scheduler.reschedule_monitor("m1");

        for attempt in 0..10 {
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let (s1, b1) = (scheduler.clone(), barrier.clone());
            let (s2, b2) = (scheduler.clone(), barrier.clone());
            let first = tokio::task::spawn_blocking(move || {
                b1.wait();
                s1.reschedule_monitor("m1");
            });
            let second = tokio::task::spawn_blocking(move || {
                b2.wait();
                s2.reschedule_monitor("m1");
            });
            first.await.unwrap();
            second.await.unwrap();
            assert_eq!(
                scheduler.active_handles(),
                1,
                "overlapping reschedules left more than one live handle (attempt {})",
                attempt
            );
        }
        let persisted: Option<String> = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("SELECT scheduler_handle FROM monitors WHERE id = 'm1'", [], |r| r.get(0)).unwrap()
        };
        assert!(persisted.is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn restore_all_rebuilds_schedules_from_rows() {
        let path = format!("/tmp/pulsekeeper_sched_test_{}.db", uuid::Uuid::new_v4());
        let (db, scheduler) = test_scheduler(&path);
        {
            let conn = db.conn.lock().unwrap();
            // m1 carries a handle persisted by a previous process
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes, scheduler_handle)
                 VALUES ('m1', 'api', 'http', 'https://x.test', '{\"type\":\"http\"}', 5, 'stale-handle')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes, enabled)
                 VALUES ('m2', 'off', 'http', 'https://y.test', '{\"type\":\"http\"}', 5, 0)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO monitors (id, name, monitor_type, target, config, frequency_minutes)
                 VALUES ('hb', 'cron', 'heartbeat', '', '{\"type\":\"heartbeat\",\"expected_interval_minutes\":60}', 0)",
                [],
            )
            .unwrap();
            conn.execute("INSERT INTO jobs (id, name, frequency_minutes) VALUES ('j1', 'report', 60)", [])
                .unwrap();
            conn.execute("INSERT INTO jobs (id, name) VALUES ('j0', 'manual-only')", []).unwrap();
        }

        scheduler.restore_all();
        assert_eq!(scheduler.active_handles(), 2);

        let (monitor_handle, job_handle): (Option<String>, Option<String>) = {
            let conn = db.conn.lock().unwrap();
            let m = conn
                .query_row("SELECT scheduler_handle FROM monitors WHERE id = 'm1'", [], |r| r.get(0))
                .unwrap();
            let j = conn.query_row("SELECT scheduler_handle FROM jobs WHERE id = 'j1'", [], |r| r.get(0)).unwrap();
            (m, j)
        };
        assert!(monitor_handle.is_some());
        assert_ne!(monitor_handle.as_deref(), Some("stale-handle"));
        assert!(job_handle.is_some());
        let _ = std::fs::remove_file(&path);
    }
}
