//! Transfer pipeline
//!
//! Every successful topic reload scans the rendered markdown for cloud-storage
//! share links and dispatches them to the first supporting provider. Records
//! are persisted as `pan.json` in the topic directory; once that file exists
//! it is treated as the record of prior intent and automatic transfer is
//! skipped on later reloads. Providers report completions through a channel
//! and the pipeline reconciles them back into `pan.json` under the topic's
//! metadata lock, so provider callbacks and manual API operations can never
//! lose each other's updates.

mod baidu;
mod provider;
mod quark;

pub use baidu::{Baidu, BaiduCfg};
pub use provider::{Pan, TransferUpdate, UpdateSender};
pub use quark::{Quark, QuarkCfg};

use crate::collection::{LruMap, SyncMap};
use crate::error::{Error, Result};
use crate::sandbox::RootDir;
use crate::schedule::CronScheduler;
use crate::topic::{PAN_JSON, POST_MARKDOWN, Topic};
use crate::types::{PanOp, TransferRecord, TransferStatus, TransferType};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::sync::mpsc;

/// Share links appear in the first few floors only
const MAX_SHARE_FLOOR: usize = 3;

/// Topics whose `pan.json` stays cached in memory
const PAN_CACHE_SIZE: usize = 10;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((https://pan\..+)\)").expect("share url regex"));
static TQM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"提取码[：:\s]*([a-zA-Z0-9]{4})").expect("extract code regex"));
static PWD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"解压密?码[：:\s统一为]*(.+)").expect("unzip password regex"));

/// Parse share-link records out of a topic's rendered markdown.
///
/// Scans line by line with a floor counter (`----` separators), stopping once
/// the share floors are past. URLs are de-duplicated (quoted replies repeat
/// them), extract codes attach to the most recently seen URL, and the
/// HTML-unescaped unzip password propagates to every record of the topic.
pub fn parse_records(root: &RootDir) -> Result<Vec<TransferRecord>> {
    let mut records: Vec<TransferRecord> = Vec::new();
    let mut floor = 0usize;
    let mut pwd = String::new();

    root.every_line(POST_MARKDOWN, |line, _| {
        let nl = line.trim();

        if let Some(caps) = URL_RE.captures(nl) {
            let url = caps[1].trim().to_string();
            if !records.iter().any(|r| r.url == url) {
                records.push(TransferRecord {
                    url,
                    ..Default::default()
                });
            }
        }
        if let Some(caps) = TQM_RE.captures(nl)
            && let Some(last) = records.last_mut()
        {
            last.tqm = caps[1].trim().to_string();
        }
        if let Some(caps) = PWD_RE.captures(nl) {
            pwd = caps[1].trim().to_string();
        }

        if nl == "----" {
            floor += 1;
        }
        floor <= MAX_SHARE_FLOOR
    })?;

    if !pwd.is_empty() {
        pwd = html_escape::decode_html_entities(&pwd).into_owned();
    }
    for record in &mut records {
        record.pwd = pwd.clone();
    }
    Ok(records)
}

/// The set of configured providers plus the reconciliation loop
pub struct PanHolder {
    providers: Vec<Arc<dyn Pan>>,
    topics: SyncMap<i64, Arc<Topic>>,
    cache: Arc<LruMap<i64, Vec<TransferRecord>>>,
}

impl PanHolder {
    /// Read `<dir>/config.ini` and construct the enabled providers.
    ///
    /// Provider login happens here, so construction is expected to run in a
    /// background task at startup.
    pub async fn open(
        dir: &Path,
        topics: SyncMap<i64, Arc<Topic>>,
        scheduler: &Arc<CronScheduler>,
    ) -> Result<Self> {
        let raw = tokio::fs::read_to_string(dir.join("config.ini"))
            .await
            .map_err(|e| Error::Transfer(format!("missing pan config.ini: {e}")))?;
        let mut ini = configparser::ini::Ini::new();
        ini.read(raw)
            .map_err(|e| Error::Transfer(format!("unreadable pan config.ini: {e}")))?;

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let mut providers: Vec<Arc<dyn Pan>> = Vec::new();

        if ini.getbool("baidu", "enable").ok().flatten().unwrap_or(false) {
            let cfg = BaiduCfg {
                root: dir.join(ini.get("baidu", "root").unwrap_or_else(|| "baidu".into())),
                transfer: parse_transfer_type(ini.get("baidu", "transfer")),
                directory: ini.get("baidu", "directory").unwrap_or_default(),
                bduss: ini.get("baidu", "bduss").unwrap_or_default(),
                stoken: ini.get("baidu", "stoken").unwrap_or_default(),
            };
            match Baidu::open(cfg, update_tx.clone(), scheduler).await {
                Ok(p) => providers.push(p),
                Err(e) => tracing::error!(error = %e, "baidu provider init failed"),
            }
        }
        if ini.getbool("quark", "enable").ok().flatten().unwrap_or(false) {
            let cfg = QuarkCfg {
                root: dir.join(ini.get("quark", "root").unwrap_or_else(|| "quark".into())),
                transfer: parse_transfer_type(ini.get("quark", "transfer")),
                directory: ini.get("quark", "directory").unwrap_or_default(),
                cookie: ini.get("quark", "cookie").unwrap_or_default(),
                base_url: String::new(),
            };
            match Quark::open(cfg, update_tx.clone()).await {
                Ok(p) => providers.push(p),
                Err(e) => tracing::error!(error = %e, "quark provider init failed"),
            }
        }

        if providers.is_empty() {
            return Err(Error::Transfer("no enabled pan provider".to_string()));
        }
        tracing::info!(
            providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "pan providers ready"
        );

        let holder = Self {
            providers,
            topics: topics.clone(),
            cache: Arc::new(LruMap::with_capacity(PAN_CACHE_SIZE)),
        };
        holder.spawn_reconciler(update_rx);
        Ok(holder)
    }

    /// Build a holder directly from providers (tests).
    #[cfg(test)]
    pub(crate) fn with_providers(
        providers: Vec<Arc<dyn Pan>>,
        topics: SyncMap<i64, Arc<Topic>>,
        update_rx: mpsc::UnboundedReceiver<TransferUpdate>,
    ) -> Self {
        let holder = Self {
            providers,
            topics,
            cache: Arc::new(LruMap::with_capacity(PAN_CACHE_SIZE)),
        };
        holder.spawn_reconciler(update_rx);
        holder
    }

    fn spawn_reconciler(&self, mut rx: mpsc::UnboundedReceiver<TransferUpdate>) {
        let topics = self.topics.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = reconcile(&topics, &cache, &update).await {
                    tracing::warn!(
                        topic = update.topic_id.0,
                        url = %update.url,
                        error = %e,
                        "transfer reconciliation failed"
                    );
                }
            }
            tracing::debug!("transfer reconciler stopped");
        });
    }

    /// Parse and auto-dispatch share links after a successful reload.
    ///
    /// Skipped entirely when `pan.json` already exists: the file records
    /// prior intent, including records the operator deleted on purpose.
    pub async fn auto_transfer(&self, topic: &Arc<Topic>) {
        let _meta = topic.lock_meta().await;
        if topic.root().is_exist(PAN_JSON) {
            return;
        }
        let mut records = match parse_records(topic.root()) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(topic = topic.id.0, error = %e, "share-link parse failed");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        for record in &mut records {
            let Some(provider) = self
                .providers
                .iter()
                .find(|p| p.supports(record) && p.transfer_type() == TransferType::Auto)
            else {
                continue;
            };
            record.name = provider.name().to_string();
            record.status = TransferStatus::Pending;
            if let Err(e) = provider.transfer(topic.id, record.clone()).await {
                tracing::warn!(
                    topic = topic.id.0,
                    provider = provider.name(),
                    error = %e,
                    "transfer dispatch failed"
                );
                record.status = TransferStatus::Failed;
                record.message = e.to_string();
            }
        }

        if let Err(e) = write_records(topic.root(), &records) {
            tracing::warn!(topic = topic.id.0, error = %e, "persisting pan.json failed");
            return;
        }
        self.cache.put(topic.id.0, records);
    }

    /// The topic's transfer records (LRU-cached).
    pub async fn records(&self, topic: &Arc<Topic>) -> Result<Vec<TransferRecord>> {
        if let Some(records) = self.cache.get(&topic.id.0) {
            return Ok(records);
        }
        let _meta = topic.lock_meta().await;
        let records = read_records(topic.root())?;
        self.cache.put(topic.id.0, records.clone());
        Ok(records)
    }

    /// Manual operation on one record: `save`/`retry` reset it to pending and
    /// re-dispatch; `delete` asks the provider to remove the saved copy.
    pub async fn operate(&self, topic: &Arc<Topic>, url: &str, op: PanOp) -> Result<()> {
        let _meta = topic.lock_meta().await;
        let mut records = read_records(topic.root())?;
        let record = records
            .iter_mut()
            .find(|r| r.url == url)
            .ok_or_else(|| Error::Transfer(format!("no record for {url}")))?;

        let provider = self
            .providers
            .iter()
            .find(|p| {
                if record.name.is_empty() {
                    p.supports(record)
                } else {
                    p.name() == record.name
                }
            })
            .ok_or_else(|| Error::Transfer(format!("no provider for {url}")))?;

        record.name = provider.name().to_string();
        if op == PanOp::Save {
            record.status = TransferStatus::Pending;
            record.message.clear();
        }
        provider.operate(topic.id, record.clone(), op).await?;

        write_records(topic.root(), &records)?;
        self.cache.put(topic.id.0, records);
        Ok(())
    }

    /// Close every provider queue.
    pub async fn close(&self) {
        for provider in &self.providers {
            provider.close().await;
        }
    }
}

/// Apply one provider completion to the topic's `pan.json`.
async fn reconcile(
    topics: &SyncMap<i64, Arc<Topic>>,
    cache: &LruMap<i64, Vec<TransferRecord>>,
    update: &TransferUpdate,
) -> Result<()> {
    let topic = topics
        .get(&update.topic_id.0)
        .ok_or(Error::TopicNotFound(update.topic_id.0))?;
    let _meta = topic.lock_meta().await;
    let mut records = read_records(topic.root())?;
    let Some(record) = records.iter_mut().find(|r| r.url == update.url) else {
        return Err(Error::Transfer(format!("no record for {}", update.url)));
    };
    record.status = update.status;
    record.message = update.message.clone();
    write_records(topic.root(), &records)?;
    cache.put(topic.id.0, records);
    topic.touch();
    Ok(())
}

fn read_records(root: &RootDir) -> Result<Vec<TransferRecord>> {
    if !root.is_exist(PAN_JSON) {
        return Err(Error::Transfer("no pan.json".to_string()));
    }
    Ok(serde_json::from_slice(&root.read_all(PAN_JSON)?)?)
}

fn write_records(root: &RootDir, records: &[TransferRecord]) -> Result<()> {
    root.write_all(PAN_JSON, &serde_json::to_vec_pretty(records)?)
}

fn parse_transfer_type(raw: Option<String>) -> TransferType {
    match raw.as_deref() {
        Some("manual") => TransferType::Manual,
        _ => TransferType::Auto,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, TopicId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn root_with_post(markdown: &str) -> (tempfile::TempDir, RootDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        root.write_all(POST_MARKDOWN, markdown.as_bytes()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_parse_single_record_with_code_and_password() {
        let (_tmp, root) = root_with_post(
            "# title\n\
             [share](https://pan.baidu.com/s/abc) 提取码: 1234\n\
             解压密码: hunter2\n\
             ----\n\
             body\n",
        );
        let records = parse_records(&root).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://pan.baidu.com/s/abc");
        assert_eq!(records[0].tqm, "1234");
        assert_eq!(records[0].pwd, "hunter2");
        assert_eq!(records[0].status, TransferStatus::Pending);
    }

    #[test]
    fn test_parse_dedups_quoted_replies() {
        let (_tmp, root) = root_with_post(
            "# t\n\
             [a](https://pan.quark.cn/s/xyz)\n\
             > quote: [a](https://pan.quark.cn/s/xyz)\n\
             ----\n",
        );
        let records = parse_records(&root).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_parse_stops_after_floor_three() {
        let (_tmp, root) = root_with_post(
            "# t\n----\n----\n----\n----\n\
             [late](https://pan.baidu.com/s/too-late)\n",
        );
        let records = parse_records(&root).unwrap();
        assert!(records.is_empty(), "links past floor 3 are ignored");
    }

    #[test]
    fn test_parse_password_propagates_and_unescapes() {
        let (_tmp, root) = root_with_post(
            "# t\n\
             [a](https://pan.baidu.com/s/one) 提取码: ab12\n\
             [b](https://pan.quark.cn/s/two)\n\
             解压密码统一为: a&amp;b\n\
             ----\n",
        );
        let records = parse_records(&root).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pwd, "a&b");
        assert_eq!(records[1].pwd, "a&b");
        assert_eq!(records[0].tqm, "ab12");
        assert!(records[1].tqm.is_empty());
    }

    #[test]
    fn test_parse_is_idempotent() {
        let (_tmp, root) = root_with_post(
            "# t\n\
             [a](https://pan.baidu.com/s/one) 提取码: ab12\n\
             解压密码: p\n----\nmore\n----\n",
        );
        let first = parse_records(&root).unwrap();
        let second = parse_records(&root).unwrap();
        assert_eq!(first, second);
    }

    /// Provider stub recording calls and reporting via the update channel
    struct StubPan {
        transfer_type: TransferType,
        calls: Mutex<Vec<(i64, String, Option<PanOp>)>>,
        updates: UpdateSender,
        outcome: TransferStatus,
    }

    #[async_trait]
    impl Pan for StubPan {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn transfer_type(&self) -> TransferType {
            self.transfer_type
        }
        fn supports(&self, record: &TransferRecord) -> bool {
            record.url.contains("pan.")
        }
        async fn transfer(&self, topic_id: TopicId, record: TransferRecord) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((topic_id.0, record.url.clone(), None));
            let _ = self.updates.send(TransferUpdate {
                topic_id,
                url: record.url,
                status: self.outcome,
                message: String::new(),
            });
            Ok(())
        }
        async fn operate(&self, topic_id: TopicId, record: TransferRecord, op: PanOp) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((topic_id.0, record.url.clone(), Some(op)));
            let _ = self.updates.send(TransferUpdate {
                topic_id,
                url: record.url,
                status: TransferStatus::Pending,
                message: String::new(),
            });
            Ok(())
        }
        async fn close(&self) {}
    }

    fn topic_in_store(markdown: &str) -> (tempfile::TempDir, SyncMap<i64, Arc<Topic>>, Arc<Topic>) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        let sub = root.open_sub("1").unwrap();
        sub.write_all(POST_MARKDOWN, markdown.as_bytes()).unwrap();
        let topic = Arc::new(Topic::new(sub, TopicId(1), Metadata::default()));
        let topics = SyncMap::new();
        topics.put(1, topic.clone());
        (dir, topics, topic)
    }

    #[tokio::test]
    async fn test_auto_transfer_dispatches_and_reconciles() {
        let (_tmp, topics, topic) =
            topic_in_store("# t\n[a](https://pan.baidu.com/s/abc) 提取码: 1234\n----\n");
        let (tx, rx) = mpsc::unbounded_channel();
        let stub = Arc::new(StubPan {
            transfer_type: TransferType::Auto,
            calls: Mutex::new(Vec::new()),
            updates: tx,
            outcome: TransferStatus::Success,
        });
        let holder = PanHolder::with_providers(vec![stub.clone()], topics, rx);

        holder.auto_transfer(&topic).await;
        assert_eq!(stub.calls.lock().unwrap().len(), 1);
        assert!(topic.root().is_exist(PAN_JSON));

        // Let the reconciler apply the stub's success report.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let records = read_records(topic.root()).unwrap();
        assert_eq!(records[0].status, TransferStatus::Success);
        assert_eq!(records[0].name, "stub");
    }

    #[tokio::test]
    async fn test_auto_transfer_skips_when_pan_json_exists() {
        let (_tmp, topics, topic) =
            topic_in_store("# t\n[a](https://pan.baidu.com/s/abc)\n----\n");
        write_records(topic.root(), &[]).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let stub = Arc::new(StubPan {
            transfer_type: TransferType::Auto,
            calls: Mutex::new(Vec::new()),
            updates: tx,
            outcome: TransferStatus::Success,
        });
        let holder = PanHolder::with_providers(vec![stub.clone()], topics, rx);

        holder.auto_transfer(&topic).await;
        assert!(
            stub.calls.lock().unwrap().is_empty(),
            "existing pan.json records prior intent"
        );
    }

    #[tokio::test]
    async fn test_manual_delete_resets_record_to_pending() {
        let (_tmp, topics, topic) =
            topic_in_store("# t\n[a](https://pan.baidu.com/s/abc)\n----\n");
        write_records(
            topic.root(),
            &[TransferRecord {
                url: "https://pan.baidu.com/s/abc".into(),
                name: "stub".into(),
                status: TransferStatus::Success,
                ..Default::default()
            }],
        )
        .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let stub = Arc::new(StubPan {
            transfer_type: TransferType::Auto,
            calls: Mutex::new(Vec::new()),
            updates: tx,
            outcome: TransferStatus::Success,
        });
        let holder = PanHolder::with_providers(vec![stub.clone()], topics, rx);

        holder
            .operate(&topic, "https://pan.baidu.com/s/abc", PanOp::Delete)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let records = read_records(topic.root()).unwrap();
        assert_eq!(
            records[0].status,
            TransferStatus::Pending,
            "a deleted save shows pending again"
        );
        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls[0].2, Some(PanOp::Delete));
    }

    #[tokio::test]
    async fn test_operate_unknown_url_errors() {
        let (_tmp, topics, topic) = topic_in_store("# t\n----\n");
        write_records(topic.root(), &[]).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let stub = Arc::new(StubPan {
            transfer_type: TransferType::Auto,
            calls: Mutex::new(Vec::new()),
            updates: tx,
            outcome: TransferStatus::Success,
        });
        let holder = PanHolder::with_providers(vec![stub], topics, rx);
        let err = holder
            .operate(&topic, "https://pan.baidu.com/s/none", PanOp::Save)
            .await;
        assert!(matches!(err, Err(Error::Transfer(_))));
    }
}
