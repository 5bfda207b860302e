//! Core types for nga-mirror

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Unique identifier for a mirrored topic (forum thread)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct TopicId(pub i64);

impl TopicId {
    /// Create a new TopicId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TopicId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TopicId> for i64 {
    fn from(id: TopicId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for TopicId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TopicId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Opaque handle to a registered cron entry; `0` means "no entry"
pub type CronHandle = u64;

/// Persisted scheduling metadata of a topic (`metadata.json`)
///
/// Field names match the sidecar format written by earlier deployments, so
/// existing topic directories load unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Metadata {
    /// Cron expression driving periodic refreshes (five-field or `@every <dur>`);
    /// empty disables scheduling
    #[serde(rename = "UpdateCron", default)]
    pub update_cron: String,

    /// Retry budget: `0` = default (3), `< 0` = never abandon, `> 0` = hard limit
    #[serde(rename = "MaxRetryCount", default)]
    pub max_retry_count: i32,

    /// Terminal flag: no scheduled refresh until the metadata is rewritten
    #[serde(rename = "Abandon", default)]
    pub abandon: bool,

    /// Consecutive failure count (in-memory only)
    #[serde(skip)]
    pub retry_count: i32,

    /// Registered cron entry, if any (in-memory only)
    #[serde(skip)]
    pub cron_handle: CronHandle,
}

impl Metadata {
    /// Merge an update request onto this metadata.
    ///
    /// Overwrites the three caller-controlled fields; the in-memory retry
    /// counter and cron handle are left untouched.
    pub fn merge(&mut self, other: &Metadata) {
        self.update_cron = other.update_cron.clone();
        self.max_retry_count = other.max_retry_count;
        self.abandon = other.abandon;
    }

    /// The effective retry limit, or `None` when retries are unbounded
    pub fn effective_max_retry(&self) -> Option<i32> {
        const DEFAULT_MAX_RETRY: i32 = 3;
        match self.max_retry_count {
            0 => Some(DEFAULT_MAX_RETRY),
            n if n < 0 => None,
            n => Some(n),
        }
    }
}

/// Outcome of the most recent download attempt for a topic
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct DownResult {
    /// Whether the downloader reported end-of-task
    #[serde(rename = "Success")]
    pub success: bool,

    /// Failure message extracted from the downloader output (empty on success)
    #[serde(rename = "Message", default)]
    pub message: String,

    /// When the attempt finished
    #[serde(rename = "Time")]
    pub time: Option<DateTime<Utc>>,
}

/// Status of a single share-link transfer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Dispatched to a provider, not yet reconciled
    #[default]
    Pending,
    /// Provider reported success
    Success,
    /// Provider reported failure; `message` carries the reason
    Failed,
}

/// A share-link row persisted in a topic's `pan.json`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TransferRecord {
    /// The provider share URL (identity within a topic)
    pub url: String,

    /// Provider name once matched (e.g. "baidu", "quark")
    #[serde(default)]
    pub name: String,

    /// Four-character extract code, if one was found near the URL
    #[serde(default)]
    pub tqm: String,

    /// Unzip password shared by all records of the topic
    #[serde(default)]
    pub pwd: String,

    /// Reconciled transfer status
    #[serde(default)]
    pub status: TransferStatus,

    /// Provider failure message, if any
    #[serde(default)]
    pub message: String,
}

/// Manual operation on a transfer record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanOp {
    /// (Re)save the share into the provider account
    Save,
    /// Delete the saved copy from the provider account
    Delete,
}

/// Whether a provider transfers automatically on topic reload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Transfer on every successful reload that finds new share links
    #[default]
    Auto,
    /// Transfer only on explicit API request
    Manual,
}

/// A forum author record (`users/<uid>.json`)
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UserRecord {
    /// Forum user id
    #[serde(rename = "Id")]
    pub id: i64,

    /// Display name (replaced in-place on rename)
    #[serde(rename = "Name")]
    pub name: String,

    /// IP location string as shown on the profile page
    #[serde(rename = "Loc", default)]
    pub loc: String,

    /// Registration date
    #[serde(rename = "RegDate")]
    pub reg_date: Option<DateTime<Utc>>,

    /// Whether the subscription loop follows this author
    #[serde(rename = "Subscribed", default)]
    pub subscribed: bool,

    /// Title filter: each entry is a substring or a `+`-joined conjunction;
    /// entries are OR-combined; `None`/empty accepts everything
    #[serde(rename = "Filter", default)]
    pub filter: Option<Vec<String>>,
}
