use serde::{Deserialize, Serialize};

/// Deserialize a double-option field: absent → None, null → Some(None), value → Some(Some(v))
fn deserialize_optional_nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    // If serde calls this, the field was present in JSON
    Ok(Some(Option::deserialize(deserializer)?))
}

/// Per-type check parameters. The JSON `type` tag doubles as the monitor type.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckConfig {
    Http {
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<serde_json::Value>,
        #[serde(default = "default_status_min")]
        expected_status_min: u16,
        #[serde(default = "default_status_max")]
        expected_status_max: u16,
    },
    Website {
        #[serde(default = "default_method")]
        method: String,
        #[serde(default = "default_status_min")]
        expected_status_min: u16,
        #[serde(default = "default_status_max")]
        expected_status_max: u16,
        #[serde(default = "default_check_ssl")]
        check_ssl: bool,
    },
    Ping,
    Port,
    Heartbeat {
        expected_interval_minutes: u32,
        #[serde(default)]
        grace_period_minutes: u32,
    },
}

fn default_method() -> String { "GET".into() }
fn default_status_min() -> u16 { 200 }
fn default_status_max() -> u16 { 299 }
fn default_check_ssl() -> bool { true }

impl CheckConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckConfig::Http { .. } => "http",
            CheckConfig::Website { .. } => "website",
            CheckConfig::Ping => "ping",
            CheckConfig::Port => "port",
            CheckConfig::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn validate(&self, target: &str) -> Result<(), String> {
        match self {
            CheckConfig::Http { expected_status_min, expected_status_max, .. }
            | CheckConfig::Website { expected_status_min, expected_status_max, .. } => {
                if !target.starts_with("http://") && !target.starts_with("https://") {
                    return Err("target must start with http:// or https://".into());
                }
                if *expected_status_min < 100 || *expected_status_max > 599 {
                    return Err("expected status range must lie within 100-599".into());
                }
                if expected_status_min > expected_status_max {
                    return Err("expected_status_min must not exceed expected_status_max".into());
                }
                Ok(())
            }
            CheckConfig::Ping => {
                if target.trim().is_empty() {
                    return Err("target host is required for ping monitors".into());
                }
                Ok(())
            }
            CheckConfig::Port => {
                let Some((host, port)) = target.rsplit_once(':') else {
                    return Err("target must be host:port for port monitors".into());
                };
                if host.trim().is_empty() || port.parse::<u16>().is_err() {
                    return Err("target must be host:port with a valid port number".into());
                }
                Ok(())
            }
            CheckConfig::Heartbeat { expected_interval_minutes, .. } => {
                if *expected_interval_minutes < 1 {
                    return Err("expected_interval_minutes must be at least 1".into());
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default = "default_true")]
    pub alert_on_recovery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            enabled: true,
            alert_on_failure: true,
            alert_on_recovery: true,
            custom_message: None,
        }
    }
}

fn default_true() -> bool { true }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Monitor {
    pub id: String,
    pub name: String,
    pub monitor_type: String,
    pub target: String,
    pub config: CheckConfig,
    pub frequency_minutes: u32,
    pub enabled: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_change_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_config: Option<AlertConfig>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateMonitor {
    pub name: String,
    #[serde(default)]
    pub target: String,
    pub config: CheckConfig,
    #[serde(default = "default_frequency")]
    pub frequency_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub alert_config: Option<AlertConfig>,
}

fn default_frequency() -> u32 { 5 }
fn default_enabled() -> bool { true }

#[derive(Debug, Deserialize)]
pub struct UpdateMonitor {
    pub name: Option<String>,
    pub target: Option<String>,
    pub config: Option<CheckConfig>,
    pub frequency_minutes: Option<u32>,
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_optional_nullable")]
    pub alert_config: Option<Option<AlertConfig>>,
}

#[derive(Debug, Serialize)]
pub struct CreateMonitorResponse {
    pub monitor: Monitor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_url: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct MonitorResult {
    pub id: String,
    pub monitor_id: String,
    pub status: String,
    pub is_up: bool,
    pub is_status_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub checked_at: String,
    pub seq: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub frequency_minutes: u32,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateJob {
    pub name: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub frequency_minutes: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_payload() -> serde_json::Value { serde_json::json!({}) }

#[derive(Debug, Deserialize)]
pub struct UpdateJob {
    pub name: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub frequency_minutes: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize, Clone)]
pub struct Run {
    pub id: String,
    pub job_id: String,
    pub trigger: String,
    pub state: String,
    pub queued_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub seq: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct AlertEvent {
    pub id: String,
    pub event_type: String,
    pub target_type: String,
    pub target_id: String,
    pub severity: String,
    pub message: String,
    /// Per-provider delivery outcomes, as attempted.
    pub providers: serde_json::Value,
    pub status: String,
    pub created_at: String,
    pub seq: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct NotificationChannel {
    pub id: String,
    pub monitor_id: String,
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
    pub is_enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateNotification {
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateNotification {
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
    pub is_enabled: Option<bool>,
}
