use crate::db::Db;
use crate::models::AlertConfig;
use crate::notifications::{self, NotificationPayload, ProviderOutcome};
use crate::publisher::EventBroadcaster;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// How a finished check is labeled in the result log. `Timeout` is the
/// synthetic label written by the overdue detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultLabel {
    Up,
    Down,
    Timeout,
}

impl ResultLabel {
    pub fn from_success(success: bool) -> Self {
        if success { ResultLabel::Up } else { ResultLabel::Down }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultLabel::Up => "up",
            ResultLabel::Down => "down",
            ResultLabel::Timeout => "timeout",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, ResultLabel::Up)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Down,
    Recovery,
}

/// No prior result counts as up, so a first result only registers a change
/// when it is a failure.
fn detect_transition(prev_is_up: Option<bool>, is_up: bool) -> (bool, Option<Transition>) {
    let is_status_change = match prev_is_up {
        Some(prev) => prev != is_up,
        None => !is_up,
    };
    let transition = if is_status_change && !is_up {
        Some(Transition::Down)
    } else if is_status_change && is_up && prev_is_up == Some(false) {
        Some(Transition::Recovery)
    } else {
        None
    };
    (is_status_change, transition)
}

/// Aggregate provider outcomes into an AlertEvent status + message.
fn aggregate_outcomes(outcomes: &[ProviderOutcome], base_message: &str) -> (String, String) {
    if outcomes.is_empty() {
        return ("pending".to_string(), base_message.to_string());
    }
    let total = outcomes.len();
    let failed = outcomes.iter().filter(|o| !o.ok).count();
    if failed == 0 {
        ("sent".to_string(), base_message.to_string())
    } else {
        let status = if failed == total { "failed" } else { "sent" };
        (status.to_string(), format!("{} ({} of {} providers failed)", base_message, failed, total))
    }
}

fn now_str() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Everything that happens after a check finishes: append the result row,
/// flip monitor status, publish to subscribers, and fan alerts out on
/// up/down transitions. All check paths (dispatch, heartbeat pings, overdue
/// scan) converge here so the result log has a single writer.
pub struct ResultPipeline {
    db: Arc<Db>,
    broadcaster: Arc<EventBroadcaster>,
    client: reqwest::Client,
}

struct WriteOutcome {
    result: crate::models::MonitorResult,
    monitor_name: String,
    alert_config: Option<AlertConfig>,
    transition: Option<Transition>,
}

impl ResultPipeline {
    pub fn new(db: Arc<Db>, broadcaster: Arc<EventBroadcaster>, client: reqwest::Client) -> Self {
        ResultPipeline { db, broadcaster, client }
    }

    pub async fn process_check_result(
        &self,
        monitor_id: &str,
        label: ResultLabel,
        response_time_ms: Option<u32>,
        details: Option<String>,
    ) -> rusqlite::Result<crate::models::MonitorResult> {
        let outcome = self.write_result(monitor_id, label, response_time_ms, details.clone())?;

        self.broadcaster.publish(
            "check.completed",
            monitor_id,
            serde_json::json!({
                "monitor_id": monitor_id,
                "status": outcome.result.status,
                "is_up": outcome.result.is_up,
                "is_status_change": outcome.result.is_status_change,
                "response_time_ms": outcome.result.response_time_ms,
                "checked_at": outcome.result.checked_at,
            }),
        );

        if let Some(transition) = outcome.transition {
            self.dispatch_alert(monitor_id, &outcome.monitor_name, transition, outcome.alert_config, details)
                .await;
        }

        Ok(outcome.result)
    }

    /// Scoped DB lock: read previous state, append the result, update the
    /// monitor row. Released before any publish or network call.
    fn write_result(
        &self,
        monitor_id: &str,
        label: ResultLabel,
        response_time_ms: Option<u32>,
        details: Option<String>,
    ) -> rusqlite::Result<WriteOutcome> {
        let conn = self.db.conn.lock().unwrap();

        let (monitor_name, alert_config_str): (String, Option<String>) = conn.query_row(
            "SELECT name, alert_config FROM monitors WHERE id = ?1",
            params![monitor_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let prev_is_up: Option<bool> = conn
            .query_row(
                "SELECT is_up FROM monitor_results WHERE monitor_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![monitor_id],
                |row| Ok(row.get::<_, i32>(0)? != 0),
            )
            .optional()?;

        let is_up = label.is_up();
        let (is_status_change, transition) = detect_transition(prev_is_up, is_up);

        let id = uuid::Uuid::new_v4().to_string();
        let checked_at = now_str();
        let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM monitor_results", [], |r| r.get(0))?;
        conn.execute(
            "INSERT INTO monitor_results (id, monitor_id, status, is_up, is_status_change, response_time_ms, details, checked_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![id, monitor_id, label.as_str(), is_up, is_status_change, response_time_ms, details, checked_at, seq],
        )?;

        let new_status = if is_up { "up" } else { "down" };
        if is_status_change {
            conn.execute(
                "UPDATE monitors SET status = ?1, last_check_at = ?2, last_status_change_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![new_status, checked_at, monitor_id],
            )?;
        } else {
            conn.execute(
                "UPDATE monitors SET status = ?1, last_check_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![new_status, checked_at, monitor_id],
            )?;
        }

        Ok(WriteOutcome {
            result: crate::models::MonitorResult {
                id,
                monitor_id: monitor_id.to_string(),
                status: label.as_str().to_string(),
                is_up,
                is_status_change,
                response_time_ms,
                details,
                checked_at,
                seq,
            },
            monitor_name,
            alert_config: alert_config_str.and_then(|s| serde_json::from_str(&s).ok()),
            transition,
        })
    }

    async fn dispatch_alert(
        &self,
        monitor_id: &str,
        monitor_name: &str,
        transition: Transition,
        alert_config: Option<AlertConfig>,
        details: Option<String>,
    ) {
        // No stored config means alerting with the defaults
        let cfg = alert_config.unwrap_or_default();
        if !cfg.enabled {
            return;
        }
        let wanted = match transition {
            Transition::Down => cfg.alert_on_failure,
            Transition::Recovery => cfg.alert_on_recovery,
        };
        if !wanted {
            return;
        }

        let (event_type, severity) = match transition {
            Transition::Down => ("monitor_failure", "critical"),
            Transition::Recovery => ("monitor_recovery", "info"),
        };
        let base_message = cfg.custom_message.clone().unwrap_or_else(|| match transition {
            Transition::Down => format!("Monitor {} is down", monitor_name),
            Transition::Recovery => format!("Monitor {} recovered", monitor_name),
        });

        let channels = notifications::get_enabled_channels(&self.db, monitor_id);
        let payload = NotificationPayload {
            event_type: event_type.to_string(),
            target_id: monitor_id.to_string(),
            target_name: monitor_name.to_string(),
            severity: severity.to_string(),
            message: base_message.clone(),
            details,
            timestamp: now_str(),
        };

        let outcomes = if channels.is_empty() {
            Vec::new()
        } else {
            notifications::fan_out(&self.client, &channels, &payload).await
        };
        let (status, message) = aggregate_outcomes(&outcomes, &base_message);

        let event_id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.db.conn.lock().unwrap();
            let seq: i64 = conn
                .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM alert_events", [], |r| r.get(0))
                .unwrap_or(1);
            let providers = serde_json::to_string(&outcomes).unwrap_or_else(|_| "[]".to_string());
            let _ = conn.execute(
                "INSERT INTO alert_events (id, event_type, target_type, target_id, severity, message, providers, status, seq)
                 VALUES (?1, ?2, 'monitor', ?3, ?4, ?5, ?6, ?7, ?8)",
                params![event_id, event_type, monitor_id, severity, message, providers, status, seq],
            );
        }

        println!("🔔 Alert {} for {} → {}", event_type, monitor_name, status);
        self.broadcaster.publish(
            "alert.dispatched",
            monitor_id,
            serde_json::json!({
                "alert_event_id": event_id,
                "event_type": event_type,
                "status": status,
                "message": message,
            }),
        );
    }
}
