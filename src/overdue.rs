use crate::alerts::{ResultLabel, ResultPipeline};
use crate::db::Db;
use crate::models::CheckConfig;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ScanSummary {
    pub checked: usize,
    pub missed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

struct HeartbeatRow {
    id: String,
    config: String,
    status: String,
    last_ping_at: Option<String>,
    created_at: String,
}

fn minutes_since(timestamp: &str, now: DateTime<Utc>) -> Option<i64> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S").ok()?;
    Some((now - parsed.and_utc()).num_minutes())
}

/// Pre-filter: could this monitor plausibly cross its deadline within the
/// current tick? Keeps the precise pass O(candidates), not O(monitors).
pub fn within_one_tick_of_deadline(elapsed_minutes: i64, deadline_minutes: i64, tick_minutes: i64) -> bool {
    elapsed_minutes > deadline_minutes - tick_minutes
}

pub fn past_deadline(elapsed_minutes: i64, deadline_minutes: i64) -> bool {
    elapsed_minutes > deadline_minutes
}

/// One batch pass over enabled heartbeat monitors. Never-pinged monitors are
/// measured from `created_at` so brand-new monitors are not skipped forever.
/// Already-down monitors are examined but never re-written, which keeps the
/// scan idempotent until the next ping arrives.
pub async fn scan(db: &Db, pipeline: &ResultPipeline, tick_minutes: u32) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let now = Utc::now();

    let rows: Vec<HeartbeatRow> = {
        let conn = db.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, config, status, last_ping_at, created_at FROM monitors
             WHERE enabled = 1 AND monitor_type = 'heartbeat'",
        ) {
            Ok(s) => s,
            Err(e) => {
                summary.errors.push(format!("load failed: {}", e));
                return summary;
            }
        };
        let mapped = stmt.query_map([], |row| {
            Ok(HeartbeatRow {
                id: row.get(0)?,
                config: row.get(1)?,
                status: row.get(2)?,
                last_ping_at: row.get(3)?,
                created_at: row.get(4)?,
            })
        });
        match mapped {
            Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                summary.errors.push(format!("load failed: {}", e));
                return summary;
            }
        }
    };

    for row in rows {
        let (expected, grace) = match serde_json::from_str::<CheckConfig>(&row.config) {
            Ok(CheckConfig::Heartbeat { expected_interval_minutes, grace_period_minutes }) => {
                (expected_interval_minutes as i64, grace_period_minutes as i64)
            }
            Ok(_) => {
                summary.errors.push(format!("{}: config is not a heartbeat config", row.id));
                continue;
            }
            Err(e) => {
                summary.errors.push(format!("{}: bad config: {}", row.id, e));
                continue;
            }
        };
        let reference = row.last_ping_at.as_deref().unwrap_or(&row.created_at);
        let Some(elapsed) = minutes_since(reference, now) else {
            summary.errors.push(format!("{}: unparseable timestamp {:?}", row.id, reference));
            continue;
        };
        let deadline = expected + grace;

        if !within_one_tick_of_deadline(elapsed, deadline, tick_minutes as i64) {
            summary.skipped += 1;
            continue;
        }
        summary.checked += 1;
        if !past_deadline(elapsed, deadline) || row.status == "down" {
            continue;
        }

        let details = format!(
            "No heartbeat received for {} minutes (expected every {} min, grace {} min)",
            elapsed, expected, grace
        );
        match pipeline.process_check_result(&row.id, ResultLabel::Timeout, None, Some(details)).await {
            Ok(_) => {
                summary.missed += 1;
                println!("💓 Heartbeat missed for {}: {} minutes since last ping", row.id, elapsed);
            }
            Err(e) => summary.errors.push(format!("{}: {}", row.id, e)),
        }
    }

    summary
}

/// Background loop driving `scan` until shutdown.
pub async fn run_overdue_scanner(
    db: Arc<Db>,
    pipeline: Arc<ResultPipeline>,
    scan_minutes: u32,
    shutdown: rocket::Shutdown,
) {
    // Let liftoff settle before the first pass
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(10)) => {},
        _ = shutdown.clone() => return,
    }
    println!("💓 Heartbeat overdue scanner running every {} minute(s)", scan_minutes);
    let mut timer = tokio::time::interval(Duration::from_secs(scan_minutes as u64 * 60));
    loop {
        tokio::select! {
            _ = shutdown.clone() => {
                println!("💓 Heartbeat overdue scanner stopped");
                break;
            }
            _ = timer.tick() => {
                let summary = scan(&db, &pipeline, scan_minutes).await;
                if summary.missed > 0 || !summary.errors.is_empty() {
                    println!(
                        "💓 Overdue scan: {} checked, {} missed, {} skipped, {} error(s)",
                        summary.checked, summary.missed, summary.skipped, summary.errors.len()
                    );
                }
                for err in &summary.errors {
                    eprintln!("⚠️  Overdue scan error: {}", err);
                }
            }
        }
    }
}
