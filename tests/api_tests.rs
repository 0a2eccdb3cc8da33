use async_trait::async_trait;
use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;
use std::sync::Arc;
use std::time::Duration;

use pulsekeeper::admission::AdmissionQueue;
use pulsekeeper::alerts::ResultPipeline;
use pulsekeeper::db::Db;
use pulsekeeper::dispatch::Dispatcher;
use pulsekeeper::publisher::EventBroadcaster;
use pulsekeeper::scheduler::Scheduler;
use pulsekeeper::worker::{CheckOutcome, CheckSpec, ScriptOutcome, Worker, WorkerError};

struct MockWorker {
    check_success: bool,
}

#[async_trait]
impl Worker for MockWorker {
    async fn execute_check(&self, _spec: &CheckSpec) -> Result<CheckOutcome, WorkerError> {
        Ok(CheckOutcome {
            success: self.check_success,
            response_time_ms: Some(12),
            details: if self.check_success { None } else { Some("Simulated failure".into()) },
        })
    }

    async fn execute_script(
        &self,
        _job_id: &str,
        _run_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<ScriptOutcome, WorkerError> {
        Ok(ScriptOutcome {
            success: true,
            report_location: Some("s3://reports/latest".into()),
            error_details: None,
        })
    }
}

fn test_client_with(worker: Arc<dyn Worker>, running: usize, queued: usize) -> Client {
    let db_path = format!("/tmp/pulsekeeper_test_{}.db", uuid::Uuid::new_v4());

    let database = Arc::new(Db::new(&db_path).expect("DB init failed"));
    let broadcaster = Arc::new(EventBroadcaster::new(64));
    let pipeline = Arc::new(ResultPipeline::new(
        database.clone(),
        broadcaster.clone(),
        reqwest::Client::new(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        database.clone(),
        worker,
        pipeline.clone(),
        AdmissionQueue::new(running, queued),
        broadcaster.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(database.clone(), dispatcher.clone(), 5));

    let rocket = rocket::build()
        .manage(database)
        .manage(broadcaster)
        .manage(pipeline)
        .manage(dispatcher)
        .manage(scheduler)
        .mount("/api/v1", rocket::routes![
            pulsekeeper::routes::health,
            pulsekeeper::routes::create_monitor,
            pulsekeeper::routes::list_monitors,
            pulsekeeper::routes::get_monitor,
            pulsekeeper::routes::update_monitor,
            pulsekeeper::routes::delete_monitor,
            pulsekeeper::routes::pause_monitor,
            pulsekeeper::routes::resume_monitor,
            pulsekeeper::routes::run_monitor,
            pulsekeeper::routes::monitor_results,
            pulsekeeper::routes::heartbeat_ping,
            pulsekeeper::routes::heartbeat_fail,
            pulsekeeper::routes::create_job,
            pulsekeeper::routes::list_jobs,
            pulsekeeper::routes::get_job,
            pulsekeeper::routes::update_job,
            pulsekeeper::routes::delete_job,
            pulsekeeper::routes::run_job,
            pulsekeeper::routes::list_runs,
            pulsekeeper::routes::get_run,
            pulsekeeper::routes::create_channel,
            pulsekeeper::routes::list_channels,
            pulsekeeper::routes::update_channel,
            pulsekeeper::routes::delete_channel,
            pulsekeeper::routes::monitor_alert_events,
            pulsekeeper::routes::global_events,
            pulsekeeper::routes::monitor_events,
            pulsekeeper::routes::run_events,
        ])
        .register("/", rocket::catchers![
            pulsekeeper::catchers::bad_request,
            pulsekeeper::catchers::not_found,
            pulsekeeper::catchers::unprocessable_entity,
            pulsekeeper::catchers::too_many_requests,
            pulsekeeper::catchers::internal_error,
        ]);

    Client::tracked(rocket).expect("valid rocket instance")
}

fn test_client() -> Client {
    test_client_with(Arc::new(MockWorker { check_success: true }), 4, 8)
}

/// Spawned executions finish asynchronously; poll (each probe dispatches a
/// request, which also drives the rocket runtime) until the condition holds.
fn poll_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn create_http_monitor(client: &Client, enabled: bool) -> String {
    let body = format!(
        r#"{{"name": "API health", "target": "https://api.example.com/health", "config": {{"type": "http"}}, "enabled": {}}}"#,
        enabled
    );
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(body)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    body["monitor"]["id"].as_str().unwrap().to_string()
}

fn create_heartbeat_monitor(client: &Client) -> (String, String) {
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Nightly cron", "config": {"type": "heartbeat", "expected_interval_minutes": 60, "grace_period_minutes": 10}, "alert_config": {"enabled": true}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    let id = body["monitor"]["id"].as_str().unwrap().to_string();
    let token = body["heartbeat_token"].as_str().unwrap().to_string();
    (id, token)
}

// ── System ──

#[test]
fn test_health() {
    let client = test_client();
    let resp = client.get("/api/v1/health").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["service"], "pulsekeeper");
    assert_eq!(body["status"], "ok");
}

#[test]
fn test_unknown_route_is_caught() {
    let client = test_client();
    let resp = client.get("/api/v1/nothing-here").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
}

// ── Monitors ──

#[test]
fn test_create_monitor() {
    let client = test_client();
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "My API", "target": "https://example.com/health", "config": {"type": "http", "expected_status_min": 200, "expected_status_max": 204}, "frequency_minutes": 15, "enabled": false}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["monitor"]["name"], "My API");
    assert_eq!(body["monitor"]["target"], "https://example.com/health");
    assert_eq!(body["monitor"]["monitor_type"], "http");
    assert_eq!(body["monitor"]["frequency_minutes"], 15);
    assert_eq!(body["monitor"]["status"], "pending");
    assert_eq!(body["monitor"]["config"]["expected_status_max"], 204);
    // only heartbeat monitors get a token
    assert!(body["heartbeat_token"].is_null());
    assert!(body["ping_url"].is_null());
}

#[test]
fn test_create_monitor_validation() {
    let client = test_client();

    // Empty name
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "", "target": "https://example.com", "config": {"type": "http"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // Target without scheme
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Test", "target": "example.com", "config": {"type": "http"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // Status range outside 100-599
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Test", "target": "https://example.com", "config": {"type": "http", "expected_status_min": 200, "expected_status_max": 700}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // Port monitor without a port
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Test", "target": "example.com", "config": {"type": "port"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // Unknown config type fails serde and lands in the 422 catcher
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Test", "target": "https://example.com", "config": {"type": "carrier_pigeon"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::UnprocessableEntity);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["code"], "UNPROCESSABLE_ENTITY");
}

#[test]
fn test_get_monitor_not_found() {
    let client = test_client();
    let resp = client.get("/api/v1/monitors/nonexistent-id").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn test_list_monitors() {
    let client = test_client();
    create_http_monitor(&client, false);
    create_http_monitor(&client, false);

    let resp = client.get("/api/v1/monitors").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[test]
fn test_update_monitor() {
    let client = test_client();
    let id = create_http_monitor(&client, false);

    let resp = client.patch(format!("/api/v1/monitors/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"name": "Renamed", "frequency_minutes": 30}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["name"], "Renamed");
    assert_eq!(body["frequency_minutes"], 30);

    // The config tag pins the monitor type
    let resp = client.patch(format!("/api/v1/monitors/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"config": {"type": "ping"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn test_enabled_flag_drives_status() {
    let client = test_client();
    let id = create_http_monitor(&client, false);

    let resp = client.patch(format!("/api/v1/monitors/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"enabled": true}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["enabled"], true);

    // enabling fires one out-of-band check, which flips pending → up
    let up = poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body["status"] == "up"
    });
    assert!(up, "enable did not trigger an immediate check");

    let resp = client.patch(format!("/api/v1/monitors/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"enabled": false}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "paused");
}

#[test]
fn test_pause_resume() {
    let client = test_client();
    let id = create_http_monitor(&client, false);

    let resp = client.post(format!("/api/v1/monitors/{}/resume", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["enabled"], true);

    // resume schedules the monitor and checks it right away
    let up = poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body["status"] == "up"
    });
    assert!(up, "resume did not trigger an immediate check");

    let resp = client.post(format!("/api/v1/monitors/{}/pause", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["enabled"], false);
    assert_eq!(body["status"], "paused");
}

#[test]
fn test_delete_monitor() {
    let client = test_client();
    let id = create_http_monitor(&client, false);

    let resp = client.delete(format!("/api/v1/monitors/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    let resp = client.delete(format!("/api/v1/monitors/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

// ── Execution ──

#[test]
fn test_create_enabled_monitor_runs_first_check() {
    let client = test_client();
    let id = create_http_monitor(&client, true);

    let found = poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        !body.as_array().unwrap().is_empty()
    });
    assert!(found, "no result recorded for the creation-time check");

    let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let first = &body.as_array().unwrap()[0];
    assert_eq!(first["is_up"], true);
    assert_eq!(first["is_status_change"], false);
    assert_eq!(first["response_time_ms"], 12);

    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "up");
}

#[test]
fn test_run_now_records_a_result() {
    let client = test_client();
    let id = create_http_monitor(&client, true);

    // wait out the creation-time check first
    assert!(poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body.as_array().unwrap().len() == 1
    }));

    let resp = client.post(format!("/api/v1/monitors/{}/run", id)).dispatch();
    assert_eq!(resp.status(), Status::Accepted);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "started");

    assert!(poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body.as_array().unwrap().len() == 2
    }));
}

#[test]
fn test_run_now_rejects_paused_monitor() {
    let client = test_client();
    let id = create_http_monitor(&client, false);
    let resp = client.post(format!("/api/v1/monitors/{}/run", id)).dispatch();
    assert_eq!(resp.status(), Status::Conflict);
}

#[test]
fn test_failed_check_flips_status_and_alerts() {
    let client = test_client_with(Arc::new(MockWorker { check_success: false }), 4, 8);
    let resp = client.post("/api/v1/monitors")
        .header(ContentType::JSON)
        .body(r#"{"name": "Flaky", "target": "https://flaky.example.com", "config": {"type": "http"}, "alert_config": {"enabled": true}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    let id = body["monitor"]["id"].as_str().unwrap().to_string();

    assert!(poll_until(|| {
        let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body["status"] == "down"
    }));

    let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let first = &body.as_array().unwrap()[0];
    assert_eq!(first["is_up"], false);
    // a first failing result is a transition
    assert_eq!(first["is_status_change"], true);
    assert_eq!(first["details"], "Simulated failure");

    // alert fired with no channels configured → recorded as pending
    let resp = client.get(format!("/api/v1/monitors/{}/alert-events", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "monitor_failure");
    assert_eq!(events[0]["severity"], "critical");
    assert_eq!(events[0]["status"], "pending");
}

#[test]
fn test_capacity_exhaustion_returns_429() {
    let client = test_client_with(Arc::new(MockWorker { check_success: true }), 0, 0);
    let id = create_http_monitor(&client, true);

    let resp = client.post(format!("/api/v1/monitors/{}/run", id)).dispatch();
    assert_eq!(resp.status(), Status::TooManyRequests);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["code"], "CAPACITY");
    assert!(body["message"].as_str().unwrap().contains("capacity"));

    // nothing was silently enqueued
    let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert!(body.as_array().unwrap().is_empty());
}

// ── Heartbeats ──

#[test]
fn test_heartbeat_token_flow() {
    let client = test_client();
    let (id, token) = create_heartbeat_monitor(&client);
    assert!(token.starts_with("hb_"));

    // heartbeat monitors never get a schedule
    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["frequency_minutes"], 0);
    assert_eq!(body["monitor_type"], "heartbeat");

    // first ping: up, no transition
    let resp = client.post(format!("/api/v1/heartbeat/{}", token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["recorded"], true);
    assert_eq!(body["is_status_change"], false);

    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "up");
    assert!(body["last_ping_at"].is_string());

    // explicit failure ping flips the monitor down
    let resp = client.post(format!("/api/v1/heartbeat/{}/fail", token))
        .header(ContentType::JSON)
        .body(r#"{"details": "deploy failed"}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["is_status_change"], true);

    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "down");

    // recovery ping raises a recovery alert
    let resp = client.post(format!("/api/v1/heartbeat/{}", token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.get(format!("/api/v1/monitors/{}/alert-events", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event_type"], "monitor_recovery");
    assert_eq!(events[1]["event_type"], "monitor_failure");

    // unknown token
    let resp = client.post("/api/v1/heartbeat/hb_0000").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn test_paused_heartbeat_ping_keeps_clock_only() {
    let client = test_client();
    let (id, token) = create_heartbeat_monitor(&client);

    let resp = client.post(format!("/api/v1/monitors/{}/pause", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.post(format!("/api/v1/heartbeat/{}", token)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["recorded"], false);

    let resp = client.get(format!("/api/v1/monitors/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "paused");
    assert!(body["last_ping_at"].is_string());

    let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert!(body.as_array().unwrap().is_empty());
}

#[test]
fn test_results_pagination() {
    let client = test_client();
    let (id, token) = create_heartbeat_monitor(&client);

    client.post(format!("/api/v1/heartbeat/{}", token)).dispatch();
    client.post(format!("/api/v1/heartbeat/{}/fail", token)).dispatch();
    client.post(format!("/api/v1/heartbeat/{}", token)).dispatch();

    let resp = client.get(format!("/api/v1/monitors/{}/results?limit=2", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let newest_first = body.as_array().unwrap().clone();
    assert_eq!(newest_first.len(), 2);
    assert_eq!(newest_first[0]["status"], "up");
    assert_eq!(newest_first[1]["status"], "down");

    let oldest_seq = {
        let resp = client.get(format!("/api/v1/monitors/{}/results", id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body.as_array().unwrap().last().unwrap()["seq"].as_i64().unwrap()
    };

    let resp = client.get(format!("/api/v1/monitors/{}/results?after={}", id, oldest_seq)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let ascending = body.as_array().unwrap();
    assert_eq!(ascending.len(), 2);
    assert_eq!(ascending[0]["status"], "down");
    assert_eq!(ascending[1]["status"], "up");
}

// ── Channels ──

#[test]
fn test_channel_crud() {
    let client = test_client();
    let id = create_http_monitor(&client, false);

    // missing url fails fast
    let resp = client.post(format!("/api/v1/monitors/{}/channels", id))
        .header(ContentType::JSON)
        .body(r#"{"name": "Ops hook", "channel_type": "webhook", "config": {}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // unknown channel type
    let resp = client.post(format!("/api/v1/monitors/{}/channels", id))
        .header(ContentType::JSON)
        .body(r#"{"name": "Pager", "channel_type": "pager", "config": {}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.post(format!("/api/v1/monitors/{}/channels", id))
        .header(ContentType::JSON)
        .body(r#"{"name": "Ops hook", "channel_type": "webhook", "config": {"url": "https://hooks.example.com/x"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Created);
    let body: serde_json::Value = resp.into_json().unwrap();
    let channel_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["is_enabled"], true);

    let resp = client.get(format!("/api/v1/monitors/{}/channels", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);

    let resp = client.patch(format!("/api/v1/channels/{}", channel_id))
        .header(ContentType::JSON)
        .body(r#"{"is_enabled": false}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.delete(format!("/api/v1/channels/{}", channel_id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.delete(format!("/api/v1/channels/{}", channel_id)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    // channels hang off a real monitor
    let resp = client.get("/api/v1/monitors/ghost/channels").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

// ── Jobs & Runs ──

fn create_job(client: &Client, enabled: bool) -> String {
    let body = format!(
        r#"{{"name": "Nightly suite", "payload": {{"suite": "smoke"}}, "frequency_minutes": 0, "enabled": {}}}"#,
        enabled
    );
    let resp = client.post("/api/v1/jobs")
        .header(ContentType::JSON)
        .body(body)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    body["id"].as_str().unwrap().to_string()
}

#[test]
fn test_job_crud() {
    let client = test_client();
    let id = create_job(&client, true);

    let resp = client.get(format!("/api/v1/jobs/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["name"], "Nightly suite");
    assert_eq!(body["payload"]["suite"], "smoke");

    let resp = client.patch(format!("/api/v1/jobs/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"name": "Weekly suite", "payload": {"suite": "full"}}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/jobs/{}", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["name"], "Weekly suite");
    assert_eq!(body["payload"]["suite"], "full");

    // payload must stay an object
    let resp = client.patch(format!("/api/v1/jobs/{}", id))
        .header(ContentType::JSON)
        .body(r#"{"payload": [1, 2, 3]}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.delete(format!("/api/v1/jobs/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let resp = client.get(format!("/api/v1/jobs/{}", id)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn test_run_lifecycle() {
    let client = test_client();
    let id = create_job(&client, true);

    let resp = client.post(format!("/api/v1/jobs/{}/run", id))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(resp.status(), Status::Created);
    let body: serde_json::Value = resp.into_json().unwrap();
    let run_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["trigger"], "manual");
    assert_eq!(body["state"], "waiting");

    assert!(poll_until(|| {
        let resp = client.get(format!("/api/v1/runs/{}", run_id)).dispatch();
        let body: serde_json::Value = resp.into_json().unwrap();
        body["state"] == "completed"
    }));

    let resp = client.get(format!("/api/v1/runs/{}", run_id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["report_location"], "s3://reports/latest");
    assert!(body["started_at"].is_string());
    assert!(body["finished_at"].is_string());

    let resp = client.get(format!("/api/v1/jobs/{}/runs", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[test]
fn test_run_trigger_values() {
    let client = test_client();
    let id = create_job(&client, true);

    let resp = client.post(format!("/api/v1/jobs/{}/run", id))
        .header(ContentType::JSON)
        .body(r#"{"trigger": "remote"}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::Created);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["trigger"], "remote");

    let resp = client.post(format!("/api/v1/jobs/{}/run", id))
        .header(ContentType::JSON)
        .body(r#"{"trigger": "schedule"}"#)
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);
}

#[test]
fn test_run_disabled_job_conflicts() {
    let client = test_client();
    let id = create_job(&client, false);
    let resp = client.post(format!("/api/v1/jobs/{}/run", id))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(resp.status(), Status::Conflict);
}

#[test]
fn test_run_capacity_rejection_marks_run_failed() {
    let client = test_client_with(Arc::new(MockWorker { check_success: true }), 0, 0);
    let id = create_job(&client, true);

    let resp = client.post(format!("/api/v1/jobs/{}/run", id))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(resp.status(), Status::TooManyRequests);

    // the rejected run is persisted as failed, not silently dropped
    let resp = client.get(format!("/api/v1/jobs/{}/runs", id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    let runs = body.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["state"], "failed");
    assert!(runs[0]["error_message"].as_str().unwrap().contains("capacity"));
}
