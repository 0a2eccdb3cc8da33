use crate::admission::{Admitted, AdmissionQueue, CapacityError, Task, TaskTarget, Trigger};
use crate::alerts::{ResultLabel, ResultPipeline};
use crate::db::Db;
use crate::models::{CheckConfig, Run};
use crate::publisher::EventBroadcaster;
use crate::worker::{CheckSpec, Worker};
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Hard wall-clock ceilings per task type. The worker gets its own shorter
/// timeouts; these bound everything including a misbehaving worker impl.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(60);
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

pub enum Submitted {
    Started,
    Queued,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Runs admitted tasks against the worker boundary and converges every
/// outcome (success, worker error, timeout) into exactly one durable write.
pub struct Dispatcher {
    db: Arc<Db>,
    worker: Arc<dyn Worker>,
    pipeline: Arc<ResultPipeline>,
    admission: AdmissionQueue,
    broadcaster: Arc<EventBroadcaster>,
}

fn now_str() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Dispatcher {
    pub fn new(
        db: Arc<Db>,
        worker: Arc<dyn Worker>,
        pipeline: Arc<ResultPipeline>,
        admission: AdmissionQueue,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Dispatcher { db, worker, pipeline, admission, broadcaster }
    }

    /// Submit a task through admission. Admitted tasks start on their own
    /// tokio task; queued ones start when a running slot frees up.
    pub fn submit(self: &Arc<Self>, task: Task) -> Result<Submitted, CapacityError> {
        match self.admission.submit(task)? {
            Admitted::Run(task) => {
                let this = self.clone();
                tokio::spawn(async move { this.run_slot(task).await });
                Ok(Submitted::Started)
            }
            Admitted::Enqueued => Ok(Submitted::Queued),
        }
    }

    pub fn submit_check(self: &Arc<Self>, monitor_id: &str, trigger: Trigger) -> Result<Submitted, CapacityError> {
        self.submit(Task {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            target: TaskTarget::Check { monitor_id: monitor_id.to_string() },
        })
    }

    /// Create a run row and submit it. On capacity rejection the run is
    /// marked failed with the capacity message before the error returns.
    pub fn submit_run(
        self: &Arc<Self>,
        job_id: &str,
        payload: serde_json::Value,
        trigger: Trigger,
    ) -> Result<Run, SubmitError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let queued_at = now_str();
        let seq: i64 = {
            let conn = self.db.conn.lock().unwrap();
            let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM runs", [], |r| r.get(0))?;
            conn.execute(
                "INSERT INTO runs (id, job_id, trigger_kind, state, queued_at, seq) VALUES (?1, ?2, ?3, 'waiting', ?4, ?5)",
                params![run_id, job_id, trigger.as_str(), queued_at, seq],
            )?;
            seq
        };
        self.broadcaster.publish(
            "run.state",
            &run_id,
            serde_json::json!({ "run_id": run_id, "job_id": job_id, "state": "waiting" }),
        );

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            trigger,
            target: TaskTarget::Script {
                job_id: job_id.to_string(),
                run_id: run_id.clone(),
                payload,
            },
        };
        if let Err(cap) = self.submit(task) {
            self.finish_run(&run_id, job_id, "failed", None, Some(cap.to_string()));
            return Err(cap.into());
        }

        Ok(Run {
            id: run_id,
            job_id: job_id.to_string(),
            trigger: trigger.as_str().to_string(),
            state: "waiting".to_string(),
            queued_at,
            started_at: None,
            finished_at: None,
            report_location: None,
            error_message: None,
            seq,
        })
    }

    /// Occupies one running slot: executes the task, then drains any queued
    /// tasks promoted into the freed slot.
    async fn run_slot(&self, task: Task) {
        let mut current = Some(task);
        while let Some(task) = current.take() {
            self.execute(task).await;
            current = self.admission.complete();
        }
    }

    async fn execute(&self, task: Task) {
        match task.target {
            TaskTarget::Check { monitor_id } => self.execute_check(&monitor_id).await,
            TaskTarget::Script { job_id, run_id, payload } => {
                self.execute_script(&job_id, &run_id, &payload).await
            }
        }
    }

    async fn execute_check(&self, monitor_id: &str) {
        // Config is resolved at dispatch time; the monitor may have been
        // edited or deleted while the task sat in the queue
        let spec = {
            let conn = self.db.conn.lock().unwrap();
            conn.query_row(
                "SELECT target, config FROM monitors WHERE id = ?1 AND enabled = 1",
                params![monitor_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .ok()
            .and_then(|(target, config_str)| {
                serde_json::from_str::<CheckConfig>(&config_str).ok().map(|config| CheckSpec {
                    monitor_id: monitor_id.to_string(),
                    target,
                    config,
                })
            })
        };
        let Some(spec) = spec else {
            println!("⏱️  Skipping check for {}: monitor gone or disabled", monitor_id);
            return;
        };
        if matches!(spec.config, CheckConfig::Heartbeat { .. }) {
            // Heartbeat monitors are ping-driven; only the overdue scanner
            // and explicit fail pings may write results for them
            println!("⏱️  Skipping check for {}: heartbeat monitors are ping-driven", monitor_id);
            return;
        }

        let (label, response_time_ms, details) =
            match tokio::time::timeout(CHECK_TIMEOUT, self.worker.execute_check(&spec)).await {
                Ok(Ok(outcome)) => (
                    ResultLabel::from_success(outcome.success),
                    outcome.response_time_ms,
                    outcome.details,
                ),
                Ok(Err(e)) => (ResultLabel::Down, None, Some(format!("Worker error: {}", e))),
                Err(_) => (
                    ResultLabel::Timeout,
                    None,
                    Some(format!("Check timed out after {}s", CHECK_TIMEOUT.as_secs())),
                ),
            };

        if let Err(e) = self
            .pipeline
            .process_check_result(monitor_id, label, response_time_ms, details)
            .await
        {
            eprintln!("❌ Failed to record result for {}: {}", monitor_id, e);
        }
    }

    async fn execute_script(&self, job_id: &str, run_id: &str, payload: &serde_json::Value) {
        let started_at = now_str();
        {
            let conn = self.db.conn.lock().unwrap();
            let _ = conn.execute(
                "UPDATE runs SET state = 'running', started_at = ?1 WHERE id = ?2",
                params![started_at, run_id],
            );
        }
        self.broadcaster.publish(
            "run.state",
            run_id,
            serde_json::json!({ "run_id": run_id, "job_id": job_id, "state": "running", "started_at": started_at }),
        );

        let (state, report_location, error_message) =
            match tokio::time::timeout(SCRIPT_TIMEOUT, self.worker.execute_script(job_id, run_id, payload)).await {
                Ok(Ok(o)) if o.success => ("completed", o.report_location, None),
                Ok(Ok(o)) => (
                    "failed",
                    o.report_location,
                    o.error_details.or_else(|| Some("Script run failed".to_string())),
                ),
                Ok(Err(e)) => ("failed", None, Some(format!("Worker error: {}", e))),
                Err(_) => (
                    "failed",
                    None,
                    Some(format!("Run timed out after {}s", SCRIPT_TIMEOUT.as_secs())),
                ),
            };

        self.finish_run(run_id, job_id, state, report_location, error_message);
    }

    fn finish_run(
        &self,
        run_id: &str,
        job_id: &str,
        state: &str,
        report_location: Option<String>,
        error_message: Option<String>,
    ) {
        let finished_at = now_str();
        {
            let conn = self.db.conn.lock().unwrap();
            let _ = conn.execute(
                "UPDATE runs SET state = ?1, finished_at = ?2, report_location = ?3, error_message = ?4 WHERE id = ?5",
                params![state, finished_at, report_location, error_message, run_id],
            );
        }
        if state == "completed" {
            println!("✅ Run {} completed", run_id);
        } else {
            println!("❌ Run {} failed: {}", run_id, error_message.as_deref().unwrap_or("unknown"));
        }
        self.broadcaster.publish(
            "run.state",
            run_id,
            serde_json::json!({
                "run_id": run_id,
                "job_id": job_id,
                "state": state,
                "report_location": report_location,
                "error_message": error_message,
                "finished_at": finished_at,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{CheckOutcome, ScriptOutcome, WorkerError};
    use async_trait::async_trait;

    struct NeverWorker;

    #[async_trait]
    impl Worker for NeverWorker {
        async fn execute_check(&self, _spec: &CheckSpec) -> Result<CheckOutcome, WorkerError> {
            unreachable!("no task should reach the worker in these tests")
        }
        async fn execute_script(
            &self,
            _job_id: &str,
            _run_id: &str,
            _payload: &serde_json::Value,
        ) -> Result<ScriptOutcome, WorkerError> {
            unreachable!("no task should reach the worker in these tests")
        }
    }

    fn test_dispatcher(path: &str, running: usize, queued: usize) -> (Arc<Db>, Arc<Dispatcher>) {
        let db = Arc::new(Db::new(path).unwrap());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let pipeline = Arc::new(ResultPipeline::new(db.clone(), broadcaster.clone(), reqwest::Client::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            Arc::new(NeverWorker),
            pipeline,
            AdmissionQueue::new(running, queued),
            broadcaster,
        ));
        (db, dispatcher)
    }

    #[tokio::test]
    async fn capacity_rejection_marks_the_run_failed() {
        let path = format!("/tmp/pulsekeeper_dispatch_test_{}.db", uuid::Uuid::new_v4());
        let (db, dispatcher) = test_dispatcher(&path, 0, 0);
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("INSERT INTO jobs (id, name) VALUES ('j1', 'nightly')", []).unwrap();
        }

        let err = dispatcher
            .submit_run("j1", serde_json::json!({}), Trigger::Schedule)
            .unwrap_err();
        assert!(matches!(err, SubmitError::Capacity(_)));

        let (state, message): (String, String) = {
            let conn = db.conn.lock().unwrap();
            conn.query_row(
                "SELECT state, error_message FROM runs WHERE job_id = 'j1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap()
        };
        assert_eq!(state, "failed");
        assert!(message.contains("capacity"));
        let _ = std::fs::remove_file(&path);
    }
}
