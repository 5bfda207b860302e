//! Configuration types for nga-mirror

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use utoipa::ToSchema;

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ServerConfig {
    /// Listen port (default: 5842)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared static access token; `None` leaves every route public
    #[serde(default)]
    pub token: Option<String>,

    /// Serve the interactive Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            token: None,
            swagger_ui: false,
        }
    }
}

/// Downloader binary configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloaderConfig {
    /// Path to the ngapost2md binary (default: "ngapost2md/ngapost2md")
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Topic root override; defaults to the binary's directory
    #[serde(default)]
    pub topic_root: Option<PathBuf>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            topic_root: None,
        }
    }
}

/// Smiley serving mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SmileMode {
    /// Cache smiley images locally, downloading them on first use
    #[default]
    Local,
    /// Redirect to the forum's own image servers
    Web,
}

/// Scheduling configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ScheduleConfig {
    /// Scheduler time zone (default: "Asia/Shanghai")
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Refresh queue capacity (default: 9999)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Recycle-bin retention in hours (default: 168 = 7 days)
    #[serde(default = "default_recycle_retention_hours")]
    pub recycle_retention_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            queue_capacity: default_queue_capacity(),
            recycle_retention_hours: default_recycle_retention_hours(),
        }
    }
}

/// User-Agent policy for asset-repair fetches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UaPolicy {
    /// Pick uniformly from the built-in browser UA map on every request
    #[default]
    Random,
    /// Pin a Chrome user agent
    Chrome,
    /// Pin a Firefox user agent
    Firefox,
    /// Pin an Edge user agent
    Edge,
}

/// Asset-repair pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RepairConfig {
    /// Minimum sleep between repair tasks (default: 1s)
    #[serde(default = "default_repair_min_delay", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub min_delay: Duration,

    /// Maximum sleep between repair tasks (default: 5s)
    #[serde(default = "default_repair_max_delay", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub max_delay: Duration,

    /// Per-request timeout (default: 10s)
    #[serde(default = "default_fetch_timeout", with = "duration_secs")]
    #[schema(value_type = u64)]
    pub timeout: Duration,

    /// Retry attempts per fetch (default: 3)
    #[serde(default = "default_fetch_retries")]
    pub retries: u32,

    /// User-Agent policy
    #[serde(default)]
    pub ua_policy: UaPolicy,

    /// Extra headers attached to every repair fetch
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Optional HTTP proxy URL
    #[serde(default)]
    pub proxy: Option<String>,

    /// Host whose inline image URLs are mirrored in remote-pic mode
    /// (default: "img.nga.178.com")
    #[serde(default = "default_attachment_host")]
    pub attachment_host: String,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            min_delay: default_repair_min_delay(),
            max_delay: default_repair_max_delay(),
            timeout: default_fetch_timeout(),
            retries: default_fetch_retries(),
            ua_policy: UaPolicy::default(),
            headers: HashMap::new(),
            proxy: None,
            attachment_host: default_attachment_host(),
        }
    }
}

/// Main configuration for the mirror service
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Downloader binary settings
    #[serde(default)]
    pub downloader: DownloaderConfig,

    /// Smiley serving mode
    #[serde(default)]
    pub smile: SmileMode,

    /// Cloud-storage config directory; `None` disables transfers
    #[serde(default)]
    pub pan: Option<PathBuf>,

    /// Scheduling settings
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Asset-repair settings
    #[serde(default)]
    pub repair: RepairConfig,
}

fn default_port() -> u16 {
    5842
}

fn default_program() -> PathBuf {
    PathBuf::from("ngapost2md/ngapost2md")
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_queue_capacity() -> usize {
    9999
}

fn default_recycle_retention_hours() -> u64 {
    7 * 24
}

fn default_repair_min_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_repair_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fetch_retries() -> u32 {
    3
}

fn default_attachment_host() -> String {
    "img.nga.178.com".to_string()
}

/// Serde module for (de)serializing `Duration` as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 5842);
        assert_eq!(config.schedule.queue_capacity, 9999);
        assert_eq!(config.schedule.recycle_retention_hours, 168);
        assert_eq!(config.schedule.timezone, "Asia/Shanghai");
        assert_eq!(config.repair.retries, 3);
        assert_eq!(config.repair.timeout, Duration::from_secs(10));
        assert_eq!(config.smile, SmileMode::Local);
        assert!(config.pan.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"server":{"port":8080,"token":"t"}}"#).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.token.as_deref(), Some("t"));
        assert_eq!(config.schedule.queue_capacity, 9999);
        assert_eq!(config.repair.ua_policy, UaPolicy::Random);
    }
}
