pub mod admission;
pub mod alerts;
pub mod catchers;
pub mod db;
pub mod dispatch;
pub mod models;
pub mod notifications;
pub mod overdue;
pub mod publisher;
pub mod routes;
pub mod scheduler;
pub mod tokens;
pub mod worker;
