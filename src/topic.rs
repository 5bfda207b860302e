//! The Topic aggregate
//!
//! A topic is one mirrored forum thread: a directory named by its id holding
//! the rendered markdown, the downloader's pagination sidecar, the asset
//! manifest, and this service's own scheduling metadata. The in-memory
//! record combines what was parsed from disk with runtime-only state (cron
//! handle, retry counter, one-shot timers).

use crate::collection::SyncMap;
use crate::error::Result;
use crate::sandbox::RootDir;
use crate::types::{DownResult, Metadata, TopicId};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, RwLock};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Rendered thread markdown, written by the downloader
pub const POST_MARKDOWN: &str = "post.md";
/// Downloader pagination sidecar (`[local] max_page / max_floor`)
pub const PROCESS_INI: &str = "process.ini";
/// Downloader asset manifest
pub const ASSETS_JSON: &str = "assets.json";
/// This service's scheduling metadata sidecar
pub const METADATA_JSON: &str = "metadata.json";
/// Share-link records sidecar
pub const PAN_JSON: &str = "pan.json";

/// First-post marker carrying creation time and author:
/// `\<pid:0\> 2024-01-02 03:04:05 by someone<...`
static PID0_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\<pid:0\\>\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\s+by\s+(.+?)\s*<")
        .expect("pid:0 regex is valid")
});

/// Mutable display state of a topic, parsed from disk on every reload
#[derive(Clone, Debug, Default)]
pub struct TopicState {
    /// Title from the first markdown line
    pub title: String,
    /// Author name from the `pid:0` marker; immutable once parsed
    pub author: String,
    /// Author uid, filled lazily from the forum user lookup; final once nonzero
    pub uid: i64,
    /// Thread creation time from the `pid:0` marker
    pub create: Option<DateTime<Utc>>,
    /// Last fetched page
    pub max_page: i64,
    /// Last fetched floor
    pub max_floor: i64,
    /// Outcome of the most recent download attempt
    pub result: DownResult,
    /// Wall clock of the last observable change, for `If-Modified-Since`
    pub mod_at: DateTime<Utc>,
}

/// One mirrored forum thread
pub struct Topic {
    /// Topic id; doubles as the directory name
    pub id: TopicId,
    root: RootDir,
    state: RwLock<TopicState>,
    /// Metadata lock: guards the metadata fields and serialises every write
    /// to `metadata.json` and `pan.json` in this topic's directory
    meta: tokio::sync::Mutex<Metadata>,
    /// One-shot timers (fast-start, random jitter) keyed by delay seconds
    timers: SyncMap<u64, CancellationToken>,
    closed: AtomicBool,
}

impl Topic {
    /// Create an in-memory topic that has not been downloaded yet.
    pub fn new(root: RootDir, id: TopicId, meta: Metadata) -> Self {
        Self {
            id,
            root,
            state: RwLock::new(TopicState {
                create: Some(Utc::now()),
                mod_at: Utc::now(),
                max_page: 1,
                max_floor: -1,
                ..Default::default()
            }),
            meta: tokio::sync::Mutex::new(meta),
            timers: SyncMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Load a topic from its directory under `topic_root`.
    ///
    /// A missing `post.md` leaves title/author empty (a topic that was added
    /// but never successfully downloaded); a missing or malformed metadata
    /// sidecar falls back to defaults with a log line.
    pub fn load(topic_root: &RootDir, id: TopicId) -> Result<Self> {
        let dir = topic_root.open_sub(id.to_string())?;
        tracing::debug!(topic = id.0, path = %dir.name().display(), "loading topic");

        let mut state = TopicState {
            max_page: 1,
            max_floor: -1,
            mod_at: Utc::now(),
            ..Default::default()
        };

        if dir.is_exist(POST_MARKDOWN) {
            dir.every_line(POST_MARKDOWN, |line, i| {
                if i == 0 {
                    state.title = line.trim_start_matches(['#', ' ']).to_string();
                    return true;
                }
                if let Some(caps) = PID0_RE.captures(line) {
                    if let Ok(t) = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S") {
                        state.create = Some(t.and_utc());
                    } else {
                        tracing::warn!(topic = id.0, raw = &caps[1], "unparseable create time");
                    }
                    state.author = caps[2].to_string();
                    return false;
                }
                true
            })?;
            if state.title.is_empty() {
                tracing::warn!(topic = id.0, "no title found in {POST_MARKDOWN}");
            }
        } else {
            tracing::debug!(topic = id.0, "no {POST_MARKDOWN} yet");
        }

        if dir.is_exist(PROCESS_INI) {
            let raw = String::from_utf8_lossy(&dir.read_all(PROCESS_INI)?).into_owned();
            let mut ini = configparser::ini::Ini::new();
            if ini.read(raw).is_ok() {
                state.max_page = ini
                    .getint("local", "max_page")
                    .ok()
                    .flatten()
                    .unwrap_or(1);
                state.max_floor = ini
                    .getint("local", "max_floor")
                    .ok()
                    .flatten()
                    .unwrap_or(-1);
            }
        }

        let meta = match dir.read_all(METADATA_JSON) {
            Ok(raw) => serde_json::from_slice::<Metadata>(&raw).unwrap_or_else(|e| {
                tracing::warn!(topic = id.0, error = %e, "malformed {METADATA_JSON}");
                Metadata::default()
            }),
            Err(_) => {
                tracing::debug!(topic = id.0, "no {METADATA_JSON}");
                Metadata::default()
            }
        };

        Ok(Self {
            id,
            root: dir,
            state: RwLock::new(state),
            meta: tokio::sync::Mutex::new(meta),
            timers: SyncMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The topic's sandboxed directory.
    pub fn root(&self) -> &RootDir {
        &self.root
    }

    /// Acquire the metadata lock.
    ///
    /// Hold it for every metadata mutation and for every read-modify-write of
    /// `metadata.json` or `pan.json`.
    pub async fn lock_meta(&self) -> tokio::sync::MutexGuard<'_, Metadata> {
        self.meta.lock().await
    }

    /// Persist the current metadata to `metadata.json`.
    pub async fn save_meta(&self) -> Result<()> {
        let meta = self.meta.lock().await;
        let data = serde_json::to_vec_pretty(&*meta)?;
        self.root.write_all(METADATA_JSON, &data)
    }

    /// Read the full rendered markdown.
    pub fn content(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.root.read_all(POST_MARKDOWN)?).into_owned())
    }

    /// Snapshot of the display state.
    pub fn state(&self) -> TopicState {
        self.read_state().clone()
    }

    /// The last observable change time.
    pub fn mod_at(&self) -> DateTime<Utc> {
        self.read_state().mod_at
    }

    /// Mark the topic as observably changed.
    pub fn touch(&self) {
        self.write_state().mod_at = Utc::now();
    }

    /// Record a download outcome and touch the topic.
    pub fn set_result(&self, result: DownResult) {
        let mut state = self.write_state();
        state.result = result;
        state.mod_at = Utc::now();
    }

    /// Fill the author uid if it is still unknown.
    pub fn set_uid_if_zero(&self, uid: i64) {
        let mut state = self.write_state();
        if state.uid == 0 && uid != 0 {
            state.uid = uid;
        }
    }

    /// Register a one-shot timer so it can be cancelled on delete/update.
    pub fn add_timer(&self, delay_secs: u64, token: CancellationToken) {
        self.timers.put(delay_secs, token);
    }

    /// Forget a timer that has fired.
    pub fn remove_timer(&self, delay_secs: u64) {
        self.timers.delete(&delay_secs);
    }

    /// Cancel every pending one-shot timer.
    pub fn cancel_timers(&self) {
        self.timers.each_and_clear(|_, token| token.cancel());
    }

    /// Move pending timers onto a successor record (worker reload).
    pub fn transfer_timers_to(&self, other: &Topic) {
        self.timers.each_and_clear(|delay, token| {
            other.timers.put(*delay, token.clone());
        });
    }

    /// Whether the topic has been evicted from the store.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancel timers and mark the topic evicted; idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel_timers();
        }
    }

    /// Build the JSON view served by the API.
    pub async fn view(&self) -> TopicView {
        let meta = self.meta.lock().await.clone();
        let state = self.state();
        TopicView {
            id: self.id,
            title: state.title,
            author: state.author,
            uid: state.uid,
            create: state.create,
            max_page: state.max_page,
            max_floor: state.max_floor,
            metadata: MetadataView {
                update_cron: meta.update_cron,
                max_retry_count: meta.max_retry_count,
                abandon: meta.abandon,
                update_cron_id: meta.cron_handle,
            },
            result: state.result,
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, TopicState> {
        // State lock poisoning would mean a panic inside a plain field write.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, TopicState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Metadata as exposed over the API (includes the live cron handle)
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct MetadataView {
    /// Cron expression driving periodic refreshes
    #[serde(rename = "UpdateCron", default)]
    pub update_cron: String,
    /// Retry budget (see [`Metadata::max_retry_count`])
    #[serde(rename = "MaxRetryCount", default)]
    pub max_retry_count: i32,
    /// Whether the topic is abandoned
    #[serde(rename = "Abandon", default)]
    pub abandon: bool,
    /// Live cron entry handle; 0 when scheduling is disabled
    #[serde(rename = "updateCronId", default)]
    pub update_cron_id: u64,
}

/// A topic record as served by the API
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TopicView {
    /// Topic id
    #[serde(rename = "Id")]
    pub id: TopicId,
    /// Thread title
    #[serde(rename = "Title")]
    pub title: String,
    /// Author name
    #[serde(rename = "Author")]
    pub author: String,
    /// Author uid (0 while unknown)
    #[serde(rename = "Uid", default)]
    pub uid: i64,
    /// Thread creation time
    #[serde(rename = "Create")]
    pub create: Option<DateTime<Utc>>,
    /// Last fetched page
    #[serde(rename = "MaxPage")]
    pub max_page: i64,
    /// Last fetched floor
    #[serde(rename = "MaxFloor")]
    pub max_floor: i64,
    /// Scheduling metadata
    #[serde(rename = "Metadata")]
    pub metadata: MetadataView,
    /// Last download outcome
    #[serde(rename = "Result")]
    pub result: DownResult,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_POST: &str = "# 一个测试帖子\n\
        \n\
        <span id='pid0'>\\<pid:0\\> 2024-03-01 12:30:00 by tester<</span>\n\
        \n\
        body text\n";

    fn topic_root() -> (tempfile::TempDir, RootDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        (dir, root)
    }

    fn write_topic_files(root: &RootDir, id: i64) {
        let sub = root.open_sub(id.to_string()).unwrap();
        sub.write_all(POST_MARKDOWN, SAMPLE_POST.as_bytes()).unwrap();
        sub.write_all(PROCESS_INI, b"[local]\nmax_page = 3\nmax_floor = 57\n")
            .unwrap();
        sub.write_all(
            METADATA_JSON,
            br#"{"UpdateCron":"@every 1h","MaxRetryCount":2,"Abandon":false}"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_load_parses_header_ini_and_metadata() {
        let (_tmp, root) = topic_root();
        write_topic_files(&root, 43833908);

        let topic = Topic::load(&root, TopicId(43833908)).unwrap();
        let state = topic.state();
        assert_eq!(state.title, "一个测试帖子");
        assert_eq!(state.author, "tester");
        assert_eq!(
            state.create.unwrap().naive_utc().to_string(),
            "2024-03-01 12:30:00"
        );
        assert_eq!(state.max_page, 3);
        assert_eq!(state.max_floor, 57);

        let meta = topic.lock_meta().await;
        assert_eq!(meta.update_cron, "@every 1h");
        assert_eq!(meta.max_retry_count, 2);
        assert!(!meta.abandon);
    }

    #[tokio::test]
    async fn test_load_without_post_md_is_ok() {
        let (_tmp, root) = topic_root();
        root.open_sub("99").unwrap();
        let topic = Topic::load(&root, TopicId(99)).unwrap();
        let state = topic.state();
        assert!(state.title.is_empty());
        assert_eq!(state.max_page, 1);
        assert_eq!(state.max_floor, -1);
    }

    #[tokio::test]
    async fn test_save_meta_roundtrip() {
        let (_tmp, root) = topic_root();
        let sub = root.open_sub("7").unwrap();
        let topic = Topic::new(
            sub,
            TopicId(7),
            Metadata {
                update_cron: "@every 2h".into(),
                ..Default::default()
            },
        );
        topic.save_meta().await.unwrap();

        let reloaded = Topic::load(&root, TopicId(7)).unwrap();
        assert_eq!(reloaded.lock_meta().await.update_cron, "@every 2h");
    }

    #[test]
    fn test_uid_final_once_nonzero() {
        let (_tmp, root) = topic_root();
        let topic = Topic::new(root, TopicId(1), Metadata::default());
        topic.set_uid_if_zero(42);
        topic.set_uid_if_zero(99);
        assert_eq!(topic.state().uid, 42, "uid is final once nonzero");
    }

    #[test]
    fn test_close_cancels_timers() {
        let (_tmp, root) = topic_root();
        let topic = Topic::new(root, TopicId(1), Metadata::default());
        let token = CancellationToken::new();
        topic.add_timer(300, token.clone());
        topic.close();
        assert!(token.is_cancelled());
        assert!(topic.is_closed());
    }
}
