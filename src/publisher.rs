use crate::db::Db;
use rocket::response::stream::{Event, EventStream};
use rocket::tokio::sync::broadcast;
use rusqlite::params;
use serde::Serialize;
use std::time::Duration;
use tokio::time;

/// Event pushed to stream subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event_type: String,
    pub target_id: String,
    pub data: serde_json::Value,
}

/// Global event broadcaster. Subscribers receive all events.
pub struct EventBroadcaster {
    pub sender: broadcast::Sender<StreamEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroadcaster { sender }
    }

    pub fn publish(&self, event_type: &str, target_id: &str, data: serde_json::Value) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(StreamEvent {
            event_type: event_type.to_string(),
            target_id: target_id.to_string(),
            data,
        });
    }
}

/// Create an SSE stream for all events.
pub fn global_stream(broadcaster: &EventBroadcaster) -> EventStream![Event + '_] {
    let mut rx = broadcaster.sender.subscribe();
    EventStream! {
        loop {
            match rx.recv().await {
                Ok(evt) => {
                    let data = serde_json::to_string(&serde_json::json!({
                        "target_id": evt.target_id,
                        "data": evt.data,
                    })).unwrap_or_default();
                    yield Event::data(data).event(evt.event_type);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Event::data(format!("{{\"skipped\":{}}}", n)).event("lag");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Create an SSE stream filtered to a specific monitor.
pub fn monitor_stream<'a>(broadcaster: &'a EventBroadcaster, monitor_id: String) -> EventStream![Event + 'a] {
    let mut rx = broadcaster.sender.subscribe();
    EventStream! {
        loop {
            match rx.recv().await {
                Ok(evt) if evt.target_id == monitor_id => {
                    let data = serde_json::to_string(&evt.data).unwrap_or_default();
                    yield Event::data(data).event(evt.event_type);
                }
                Ok(_) => continue, // Different monitor, skip
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Event::data(format!("{{\"skipped\":{}}}", n)).event("lag");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn read_run_state(db: &Db, run_id: &str) -> Option<(String, serde_json::Value)> {
    let conn = db.conn.lock().unwrap();
    conn.query_row(
        "SELECT job_id, state, report_location, error_message FROM runs WHERE id = ?1",
        params![run_id],
        |row| {
            let job_id: String = row.get(0)?;
            let state: String = row.get(1)?;
            let report: Option<String> = row.get(2)?;
            let error: Option<String> = row.get(3)?;
            Ok((
                state.clone(),
                serde_json::json!({
                    "run_id": run_id,
                    "job_id": job_id,
                    "state": state,
                    "report_location": report,
                    "error_message": error,
                }),
            ))
        },
    )
    .ok()
}

fn is_terminal(state: &str) -> bool {
    state == "completed" || state == "failed"
}

/// Stream state changes for one run. Pushed events arrive over the broadcast
/// channel; a periodic read of the run row catches anything the channel
/// dropped, and comment pulses keep idle connections alive. The stream ends
/// once a terminal state has been delivered.
pub fn run_stream<'a>(db: &'a Db, broadcaster: &'a EventBroadcaster, run_id: String) -> EventStream![Event + 'a] {
    let mut rx = broadcaster.sender.subscribe();
    EventStream! {
        let mut done = false;
        // Catch up from the durable row first, so subscribers to an already
        // finished run still get exactly one terminal event.
        if let Some((state, data)) = read_run_state(db, &run_id) {
            yield Event::data(serde_json::to_string(&data).unwrap_or_default()).event("run.state");
            done = is_terminal(&state);
        }
        if !done {
            let mut keepalive = time::interval(Duration::from_secs(15));
            keepalive.tick().await; // first tick fires immediately
            let mut reconcile = time::interval(Duration::from_secs(30));
            reconcile.tick().await;
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(evt) if evt.target_id == run_id => {
                            let terminal = evt.data.get("state")
                                .and_then(|s| s.as_str())
                                .map(is_terminal)
                                .unwrap_or(false);
                            let data = serde_json::to_string(&evt.data).unwrap_or_default();
                            yield Event::data(data).event(evt.event_type);
                            if terminal { break; }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            // Missed pushes; the durable row is authoritative
                            if let Some((state, data)) = read_run_state(db, &run_id) {
                                yield Event::data(serde_json::to_string(&data).unwrap_or_default()).event("run.state");
                                if is_terminal(&state) { break; }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = keepalive.tick() => {
                        yield Event::comment("keepalive");
                    }
                    _ = reconcile.tick() => {
                        match read_run_state(db, &run_id) {
                            Some((state, data)) if is_terminal(&state) => {
                                yield Event::data(serde_json::to_string(&data).unwrap_or_default()).event("run.state");
                                break;
                            }
                            Some(_) => {}
                            None => break, // run row gone
                        }
                    }
                }
            }
        }
    }
}
