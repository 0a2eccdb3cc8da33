#[macro_use] extern crate rocket;

use pulsekeeper::admission::AdmissionQueue;
use pulsekeeper::alerts::ResultPipeline;
use pulsekeeper::db::Db;
use pulsekeeper::dispatch::Dispatcher;
use pulsekeeper::publisher::EventBroadcaster;
use pulsekeeper::scheduler::Scheduler;
use pulsekeeper::worker::HttpWorker;
use pulsekeeper::{catchers, overdue, routes};
use rocket_cors::{AllowedOrigins, CorsOptions};
use std::sync::Arc;

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[launch]
fn rocket() -> _ {
    dotenvy::dotenv().ok();

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "pulsekeeper.db".into());
    let database = Arc::new(Db::new(&db_path).expect("Failed to initialize database"));

    let running_capacity = env_u32("RUNNING_CAPACITY", 8) as usize;
    let queued_capacity = env_u32("QUEUED_CAPACITY", 32) as usize;
    let retry_limit = env_u32("SCHEDULE_RETRY_LIMIT", 5);
    let scan_minutes = env_u32("HEARTBEAT_SCAN_MINUTES", 1).max(1);
    let runner_url = std::env::var("RUNNER_URL").ok();

    let broadcaster = Arc::new(EventBroadcaster::new(256));
    let pipeline = Arc::new(ResultPipeline::new(
        database.clone(),
        broadcaster.clone(),
        reqwest::Client::new(),
    ));
    let worker = Arc::new(HttpWorker::new(runner_url));
    let dispatcher = Arc::new(Dispatcher::new(
        database.clone(),
        worker,
        pipeline.clone(),
        AdmissionQueue::new(running_capacity, queued_capacity),
        broadcaster.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(database.clone(), dispatcher.clone(), retry_limit));

    let liftoff_scheduler = scheduler.clone();
    let scanner_db = database.clone();
    let scanner_pipeline = pipeline.clone();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .to_cors()
        .expect("CORS configuration failed");

    rocket::build()
        .attach(cors)
        .manage(database)
        .manage(broadcaster)
        .manage(pipeline)
        .manage(dispatcher)
        .manage(scheduler)
        .mount("/api/v1", routes![
            routes::health,
            routes::create_monitor,
            routes::list_monitors,
            routes::get_monitor,
            routes::update_monitor,
            routes::delete_monitor,
            routes::pause_monitor,
            routes::resume_monitor,
            routes::run_monitor,
            routes::monitor_results,
            routes::heartbeat_ping,
            routes::heartbeat_fail,
            routes::create_job,
            routes::list_jobs,
            routes::get_job,
            routes::update_job,
            routes::delete_job,
            routes::run_job,
            routes::list_runs,
            routes::get_run,
            routes::create_channel,
            routes::list_channels,
            routes::update_channel,
            routes::delete_channel,
            routes::monitor_alert_events,
            routes::global_events,
            routes::monitor_events,
            routes::run_events,
        ])
        .register("/", catchers![
            catchers::bad_request,
            catchers::not_found,
            catchers::unprocessable_entity,
            catchers::too_many_requests,
            catchers::internal_error,
        ])
        .attach(rocket::fairing::AdHoc::on_liftoff("Engine", move |rocket| {
            Box::pin(async move {
                let shutdown = rocket.shutdown();
                println!("🚀 Restoring schedules and spawning overdue scanner...");
                liftoff_scheduler.restore_all();
                let handle = tokio::spawn(overdue::run_overdue_scanner(
                    scanner_db,
                    scanner_pipeline,
                    scan_minutes,
                    shutdown,
                ));
                // Surface unexpected scanner exits
                tokio::spawn(async move {
                    if let Err(e) = handle.await {
                        eprintln!("❌ Overdue scanner task failed: {e}");
                    }
                });
            })
        }))
}
