use crate::db::Db;
use crate::models::NotificationChannel;
use rusqlite::params;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Per-provider delivery deadline. A hung provider becomes its own failure,
/// never a delay for the siblings.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized alert payload handed to every provider.
#[derive(Debug, Serialize, Clone)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub target_id: String,
    pub target_name: String,
    pub severity: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("missing required config: {0}")]
    MissingConfig(&'static str),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned HTTP {0}")]
    Rejected(u16),
    #[error("smtp: {0}")]
    Smtp(String),
    #[error("unsupported channel type '{0}'")]
    Unsupported(String),
}

/// One delivery attempt's outcome, recorded verbatim on the AlertEvent row.
#[derive(Debug, Serialize, Clone)]
pub struct ProviderOutcome {
    pub provider: String,
    pub channel_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fetch enabled notification channels for a monitor.
pub fn get_enabled_channels(db: &Db, monitor_id: &str) -> Vec<NotificationChannel> {
    let conn = db.conn.lock().unwrap();
    let mut stmt = match conn.prepare(
        "SELECT id, monitor_id, name, channel_type, config, is_enabled, created_at
         FROM notification_channels WHERE monitor_id = ?1 AND is_enabled = 1",
    ) {
        Ok(s) => s,
        Err(_) => return vec![],
    };

    let rows = stmt.query_map(params![monitor_id], |row| {
        let config_str: String = row.get(4)?;
        Ok(NotificationChannel {
            id: row.get(0)?,
            monitor_id: row.get(1)?,
            name: row.get(2)?,
            channel_type: row.get(3)?,
            config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
            is_enabled: row.get::<_, i32>(5)? != 0,
            created_at: row.get(6)?,
        })
    });

    match rows {
        Ok(mapped) => mapped.filter_map(|r| r.ok()).collect(),
        Err(_) => vec![],
    }
}

/// Check that a channel config carries the fields its provider needs.
/// Called at channel creation so a dead channel never reaches dispatch.
pub fn validate_channel_config(channel_type: &str, config: &serde_json::Value) -> Result<(), String> {
    let require = |field: &str| -> Result<(), String> {
        match config.get(field).and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            _ => Err(format!("config.{} is required for {} channels", field, channel_type)),
        }
    };
    match channel_type {
        "webhook" | "chat" => require("url"),
        "bot" => {
            require("bot_token")?;
            require("chat_id")
        }
        "email" => require("address"),
        other => Err(format!("unknown channel_type '{}'", other)),
    }
}

/// Deliver one payload to every channel concurrently. Each provider runs in
/// its own task under PROVIDER_TIMEOUT; a panic or timeout is collected as
/// that provider's failure and never touches the others.
pub async fn fan_out(
    client: &reqwest::Client,
    channels: &[NotificationChannel],
    payload: &NotificationPayload,
) -> Vec<ProviderOutcome> {
    let mut handles = Vec::with_capacity(channels.len());
    for channel in channels {
        let client = client.clone();
        let channel = channel.clone();
        let payload = payload.clone();
        let provider = channel.channel_type.clone();
        let channel_id = channel.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::timeout(PROVIDER_TIMEOUT, send_one(&client, &channel, &payload)).await
        });
        handles.push((provider, channel_id, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (provider, channel_id, handle) in handles {
        let error = match handle.await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(_)) => Some("provider timed out".to_string()),
            Err(_) => Some("provider task panicked".to_string()),
        };
        if let Some(ref e) = error {
            println!("⚠️  {} delivery failed for channel {}: {}", provider, channel_id, e);
        }
        outcomes.push(ProviderOutcome { provider, channel_id, ok: error.is_none(), error });
    }
    outcomes
}

async fn send_one(
    client: &reqwest::Client,
    channel: &NotificationChannel,
    payload: &NotificationPayload,
) -> Result<(), SendError> {
    match channel.channel_type.as_str() {
        "webhook" => send_webhook(client, &channel.config, payload).await,
        "chat" => send_chat(client, &channel.config, payload).await,
        "bot" => send_bot(client, &channel.config, payload).await,
        "email" => send_email(&channel.config, payload).await,
        other => Err(SendError::Unsupported(other.to_string())),
    }
}

fn require_str<'a>(config: &'a serde_json::Value, field: &'static str) -> Result<&'a str, SendError> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or(SendError::MissingConfig(field))
}

/// Full structured JSON to an arbitrary endpoint.
async fn send_webhook(
    client: &reqwest::Client,
    config: &serde_json::Value,
    payload: &NotificationPayload,
) -> Result<(), SendError> {
    let url = require_str(config, "url")?;
    let resp = client.post(url).json(payload).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(SendError::Rejected(resp.status().as_u16()))
    }
}

/// Simple chat message: `{"content": "...", "sender": "Pulsekeeper"}`.
/// Compatible with Slack-style incoming webhooks.
async fn send_chat(
    client: &reqwest::Client,
    config: &serde_json::Value,
    payload: &NotificationPayload,
) -> Result<(), SendError> {
    let url = require_str(config, "url")?;
    let body = serde_json::json!({
        "content": format_chat_message(payload),
        "sender": "Pulsekeeper",
    });
    let resp = client.post(url).json(&body).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(SendError::Rejected(resp.status().as_u16()))
    }
}

/// Telegram-style bot message via the sendMessage API.
async fn send_bot(
    client: &reqwest::Client,
    config: &serde_json::Value,
    payload: &NotificationPayload,
) -> Result<(), SendError> {
    let bot_token = require_str(config, "bot_token")?;
    let chat_id = require_str(config, "chat_id")?;
    let api_url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let body = serde_json::json!({
        "chat_id": chat_id,
        "text": format_chat_message(payload),
    });
    let resp = client.post(&api_url).json(&body).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(SendError::Rejected(resp.status().as_u16()))
    }
}

fn event_emoji(event_type: &str) -> &'static str {
    match event_type {
        "monitor_failure" => "🔴",
        "monitor_recovery" => "🟢",
        _ => "ℹ️",
    }
}

fn event_label(event_type: &str) -> &str {
    match event_type {
        "monitor_failure" => "DOWN",
        "monitor_recovery" => "Recovered",
        other => other,
    }
}

/// Format the payload as a human-readable chat message.
fn format_chat_message(payload: &NotificationPayload) -> String {
    let mut msg = format!(
        "{} **{}** — {}",
        event_emoji(&payload.event_type),
        payload.target_name,
        event_label(&payload.event_type)
    );
    if !payload.message.is_empty() {
        msg.push_str(&format!("\n{}", payload.message));
    }
    if let Some(ref details) = payload.details {
        if !details.is_empty() {
            msg.push_str(&format!("\nCause: {}", details));
        }
    }
    msg
}

// ─── Email ──────────────────────────────────────────────────────────────────

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::OnceLock;

/// SMTP configuration loaded from environment variables once.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub tls_mode: TlsMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TlsMode {
    StartTls,
    Tls,
    None,
}

static SMTP_CONFIG: OnceLock<Option<SmtpConfig>> = OnceLock::new();

/// Load SMTP config from env vars. Returns None if SMTP_HOST is not set.
pub fn get_smtp_config() -> &'static Option<SmtpConfig> {
    SMTP_CONFIG.get_or_init(|| {
        let host = std::env::var("SMTP_HOST").ok()?;
        let port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("SMTP_FROM")
            .unwrap_or_else(|_| format!("pulsekeeper@{}", host));
        let tls_mode = match std::env::var("SMTP_TLS").unwrap_or_default().to_lowercase().as_str() {
            "tls" | "implicit" => TlsMode::Tls,
            "none" | "off" | "false" => TlsMode::None,
            _ => TlsMode::StartTls, // default
        };

        println!("📧 SMTP configured: {}:{} (from: {}, tls: {:?})", host, port, from_address, tls_mode);

        Some(SmtpConfig { host, port, username, password, from_address, tls_mode })
    })
}

fn email_subject(payload: &NotificationPayload) -> String {
    format!(
        "{} [Pulsekeeper] {} — {}",
        event_emoji(&payload.event_type),
        event_label(&payload.event_type).to_uppercase(),
        payload.target_name
    )
}

fn email_body_text(payload: &NotificationPayload) -> String {
    let mut body = String::new();
    body.push_str(&format!("Monitor: {}\n", payload.target_name));
    body.push_str(&format!("Event: {}\n", payload.event_type));
    body.push_str(&format!("Severity: {}\n", payload.severity));
    body.push_str(&format!("Time: {}\n", payload.timestamp));
    body.push_str(&format!("\n{}\n", payload.message));
    if let Some(ref details) = payload.details {
        body.push_str(&format!("Cause: {}\n", details));
    }
    body.push_str("\n--\nSent by Pulsekeeper\n");
    body
}

fn email_body_html(payload: &NotificationPayload) -> String {
    let color = match payload.event_type.as_str() {
        "monitor_failure" => "#e74c3c",
        "monitor_recovery" => "#2ecc71",
        _ => "#95a5a6",
    };
    let mut html = format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: -apple-system, 'Segoe UI', sans-serif; background: #f4f6f8; color: #222; padding: 24px;">
<div style="max-width: 560px; margin: 0 auto;">
  <div style="background: {color}; color: #fff; padding: 14px 18px; border-radius: 6px 6px 0 0; font-size: 17px; font-weight: 600;">
    {label} — {name}
  </div>
  <div style="background: #fff; padding: 18px; border: 1px solid #dde3ea; border-top: none; border-radius: 0 0 6px 6px;">
    <p style="margin: 0 0 12px;">{message}</p>
    <table style="width: 100%; border-collapse: collapse; font-size: 14px;">
      <tr><td style="padding: 4px 0; color: #667;">Severity</td><td style="padding: 4px 0;">{severity}</td></tr>
      <tr><td style="padding: 4px 0; color: #667;">Time</td><td style="padding: 4px 0;">{time}</td></tr>"#,
        color = color,
        label = event_label(&payload.event_type),
        name = html_escape(&payload.target_name),
        message = html_escape(&payload.message),
        severity = payload.severity,
        time = payload.timestamp,
    );
    if let Some(ref details) = payload.details {
        html.push_str(&format!(
            r#"
      <tr><td style="padding: 4px 0; color: #667;">Cause</td><td style="padding: 4px 0;">{}</td></tr>"#,
            html_escape(details)
        ));
    }
    html.push_str(
        r#"
    </table>
  </div>
  <div style="text-align: center; margin-top: 14px; color: #99a; font-size: 12px;">
    Sent by Pulsekeeper
  </div>
</div>
</body>
</html>"#,
    );
    html
}

/// Minimal HTML escaping for email body.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn send_email(config: &serde_json::Value, payload: &NotificationPayload) -> Result<(), SendError> {
    let address = require_str(config, "address")?;
    let smtp = match get_smtp_config() {
        Some(c) => c,
        None => return Err(SendError::MissingConfig("SMTP_HOST")),
    };

    let from = smtp
        .from_address
        .parse()
        .map_err(|e| SendError::Smtp(format!("invalid from address: {}", e)))?;
    let to = address
        .parse()
        .map_err(|e| SendError::Smtp(format!("invalid address '{}': {}", address, e)))?;

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(email_subject(payload))
        .multipart(
            lettre::message::MultiPart::alternative()
                .singlepart(
                    lettre::message::SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(email_body_text(payload)),
                )
                .singlepart(
                    lettre::message::SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(email_body_html(payload)),
                ),
        )
        .map_err(|e| SendError::Smtp(format!("build failed: {}", e)))?;

    let transport = build_transport(smtp).map_err(SendError::Smtp)?;
    transport
        .send(email)
        .await
        .map_err(|e| SendError::Smtp(e.to_string()))?;
    println!("📧 Email sent to {} for {}", address, payload.event_type);
    Ok(())
}

/// Build an async SMTP transport from config.
fn build_transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let creds = if !config.username.is_empty() {
        Some(Credentials::new(config.username.clone(), config.password.clone()))
    } else {
        None
    };

    let builder = match config.tls_mode {
        TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| format!("TLS relay error: {}", e))?
            .port(config.port),
        TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| format!("STARTTLS relay error: {}", e))?
            .port(config.port),
        TlsMode::None => {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port)
        }
    };

    let builder = if let Some(c) = creds { builder.credentials(c) } else { builder };

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_payload(event_type: &str, name: &str, details: &str) -> NotificationPayload {
        NotificationPayload {
            event_type: event_type.to_string(),
            target_id: "mon_123".to_string(),
            target_name: name.to_string(),
            severity: if event_type == "monitor_failure" { "critical" } else { "info" }.to_string(),
            message: format!("Monitor {} changed state", name),
            details: if details.is_empty() { None } else { Some(details.to_string()) },
            timestamp: "2026-02-17 03:00:00".to_string(),
        }
    }

    #[test]
    fn chat_message_failure() {
        let msg = format_chat_message(&make_payload("monitor_failure", "Blog", "Connection refused"));
        assert!(msg.contains("🔴"));
        assert!(msg.contains("**Blog**"));
        assert!(msg.contains("DOWN"));
        assert!(msg.contains("Cause: Connection refused"));
    }

    #[test]
    fn chat_message_recovery_without_details() {
        let msg = format_chat_message(&make_payload("monitor_recovery", "CDN", ""));
        assert!(msg.contains("🟢"));
        assert!(msg.contains("Recovered"));
        assert!(!msg.contains("Cause:"));
    }

    #[test]
    fn payload_type_field_is_renamed() {
        let v = serde_json::to_value(make_payload("monitor_failure", "API", "")).unwrap();
        assert_eq!(v["type"], "monitor_failure");
        assert!(v.get("event_type").is_none());
    }

    #[test]
    fn channel_config_validation() {
        let ok = serde_json::json!({"url": "https://hooks.example.com/x"});
        assert!(validate_channel_config("webhook", &ok).is_ok());
        assert!(validate_channel_config("chat", &ok).is_ok());
        assert!(validate_channel_config("webhook", &serde_json::json!({})).is_err());
        assert!(validate_channel_config("bot", &serde_json::json!({"bot_token": "t"})).is_err());
        assert!(validate_channel_config(
            "bot",
            &serde_json::json!({"bot_token": "t", "chat_id": "42"})
        )
        .is_ok());
        assert!(validate_channel_config("email", &serde_json::json!({"address": "a@b.c"})).is_ok());
        assert!(validate_channel_config("pager", &ok).is_err());
    }

    #[tokio::test]
    async fn webhook_without_url_fails_fast() {
        let client = reqwest::Client::new();
        let err = send_webhook(&client, &serde_json::json!({}), &make_payload("monitor_failure", "X", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::MissingConfig("url")));
    }

    #[test]
    fn email_bodies_carry_the_cause() {
        let payload = make_payload("monitor_failure", "API <prod>", "Expected status in 200-299, got 500");
        let text = email_body_text(&payload);
        assert!(text.contains("Cause: Expected status in 200-299, got 500"));
        let html = email_body_html(&payload);
        assert!(html.contains("API &lt;prod&gt;"));
        assert!(!html.contains("API <prod>"));
    }
}
