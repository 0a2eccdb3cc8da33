use rocket::{get, State};
use rocket::response::stream::{Event, EventStream};
use crate::db::Db;
use crate::publisher::EventBroadcaster;
use std::sync::Arc;

#[get("/events")]
pub fn global_events(broadcaster: &State<Arc<EventBroadcaster>>) -> EventStream![Event + '_] {
    crate::publisher::global_stream(broadcaster)
}

#[get("/monitors/<id>/events")]
pub fn monitor_events<'a>(id: &'a str, broadcaster: &'a State<Arc<EventBroadcaster>>) -> EventStream![Event + 'a] {
    crate::publisher::monitor_stream(broadcaster, id.to_string())
}

#[get("/runs/<id>/events")]
pub fn run_events<'a>(
    id: &'a str,
    db: &'a State<Arc<Db>>,
    broadcaster: &'a State<Arc<EventBroadcaster>>,
) -> EventStream![Event + 'a] {
    crate::publisher::run_stream(db, broadcaster, id.to_string())
}
