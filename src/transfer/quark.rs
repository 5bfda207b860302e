//! Quark netdisk provider
//!
//! Talks to the quark drive HTTP API with cookie authentication. Saves go
//! through the share flow: resolve the share token, list the shared files,
//! ensure the per-topic directory exists, then save everything that is not
//! already present. The API has server-side conflicts when parallelised, so
//! all tasks drain through one serial worker.

use super::provider::{Pan, PanTask, PROVIDER_QUEUE_SIZE, TransferUpdate, UpdateSender};
use crate::error::{Error, Result};
use crate::types::{PanOp, TopicId, TransferRecord, TransferStatus, TransferType};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_BASE_URL: &str = "https://drive-pc.quark.cn";
const DEFAULT_DIRECTORY: &str = "来自：分享";
const QUARK_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) quark-cloud-drive/3.14.2 Chrome/112.0.5615.165 \
    Electron/24.1.3.8 Safari/537.36 Channel/pckk_other_ch";

/// Share URLs look like `https://pan.quark.cn/s/<pwd_id>`
static PWD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/s/([0-9a-zA-Z]+)").expect("pwd id regex"));

/// Quark provider configuration (`[quark]` section of the pan config)
#[derive(Clone, Debug)]
pub struct QuarkCfg {
    /// Working directory holding `user.ini` when the cookie is not inline
    pub root: PathBuf,
    /// auto or manual transfer
    pub transfer: TransferType,
    /// Save directory in the drive (default `来自：分享`)
    pub directory: String,
    /// Cookie; falls back to `user.ini` in `root`
    pub cookie: String,
    /// API base override (tests); empty uses the real endpoint
    pub base_url: String,
}

/// Quark drive client
pub struct Quark {
    cfg: QuarkCfg,
    base_url: String,
    cookie: String,
    client: reqwest::Client,
    tasks: std::sync::Mutex<Option<mpsc::Sender<PanTask>>>,
}

impl Quark {
    /// Verify the login state and start the task worker.
    pub async fn open(mut cfg: QuarkCfg, updates: UpdateSender) -> Result<Arc<Self>> {
        if cfg.directory.is_empty() {
            cfg.directory = DEFAULT_DIRECTORY.to_string();
        }
        let base_url = if cfg.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.base_url.clone()
        };

        let mut cookie = cfg.cookie.trim().to_string();
        if cookie.is_empty() {
            let path = cfg.root.join("user.ini");
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Transfer(format!("quark cookie missing: {e}")))?;
            let mut ini = configparser::ini::Ini::new();
            ini.read(raw)
                .map_err(|e| Error::Transfer(format!("unreadable {}: {e}", path.display())))?;
            cookie = ini.get("default", "cookie").unwrap_or_default();
        }
        if cookie.is_empty() {
            return Err(Error::Transfer("quark cookie is empty".to_string()));
        }

        let (tx, rx) = mpsc::channel(PROVIDER_QUEUE_SIZE);
        let quark = Arc::new(Self {
            cfg,
            base_url,
            cookie,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            tasks: std::sync::Mutex::new(Some(tx)),
        });

        let nickname = quark.member_nickname().await?;
        tracing::info!(nickname, "quark login verified");

        quark.clone().spawn_worker(rx, updates);
        Ok(quark)
    }

    fn spawn_worker(self: Arc<Self>, mut rx: mpsc::Receiver<PanTask>, updates: UpdateSender) {
        tokio::spawn(async move {
            tracing::debug!("quark task worker started");
            while let Some(task) = rx.recv().await {
                let result = match task.op {
                    PanOp::Save => self.do_transfer(&task).await,
                    PanOp::Delete => self.do_delete(&task).await,
                };
                let (status, message) = match (&result, task.op) {
                    (Ok(()), PanOp::Save) => (TransferStatus::Success, String::new()),
                    (Ok(()), PanOp::Delete) => (TransferStatus::Pending, String::new()),
                    (Err(e), _) => (TransferStatus::Failed, e.to_string()),
                };
                let _ = updates.send(TransferUpdate {
                    topic_id: task.topic_id,
                    url: task.record.url,
                    status,
                    message,
                });
            }
            tracing::debug!("quark task worker stopped");
        });
    }

    async fn member_nickname(&self) -> Result<String> {
        let data = self
            .get(
                "/1/clouddrive/member/info",
                &[("pr", "ucpro"), ("fr", "pc")],
            )
            .await?;
        data["data"]["nickname"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Transfer("quark account is not logged in".to_string()))
    }

    fn topic_dir(&self, topic_id: TopicId) -> String {
        format!("{}/{}", self.cfg.directory, topic_id)
    }

    async fn do_transfer(&self, task: &PanTask) -> Result<()> {
        let url = &task.record.url;
        tracing::debug!(topic = task.topic_id.0, url = %url, "quark transfer");

        let pwd_id = PWD_ID_RE
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::Transfer(format!("{url} is not a share link")))?;
        let passcode = url
            .split_once("?pwd=")
            .map(|(_, p)| p.to_string())
            .unwrap_or_else(|| task.record.tqm.clone());

        let token = self
            .post(
                "/1/clouddrive/share/sharepage/token",
                &json!({ "pwd_id": pwd_id, "passcode": passcode }),
            )
            .await?;
        let stoken = token["data"]["stoken"]
            .as_str()
            .ok_or_else(|| Error::Transfer(format!("{url} is not sharing")))?
            .to_string();

        let detail = self
            .get(
                "/1/clouddrive/share/sharepage/detail",
                &[
                    ("pr", "ucpro"),
                    ("fr", "pc"),
                    ("pwd_id", &pwd_id),
                    ("stoken", &stoken),
                    ("pdir_fid", "0"),
                    ("_page", "1"),
                    ("_size", "100"),
                ],
            )
            .await?;
        let empty = Vec::new();
        let listed = detail["data"]["list"].as_array().unwrap_or(&empty);

        // (name, fid, token, size) of everything sharable
        let mut files = Vec::new();
        for file in listed {
            if file["ban"].as_bool().unwrap_or(false) {
                tracing::debug!(name = ?file["file_name"], "skipping banned share file");
                continue;
            }
            if let (Some(name), Some(fid), Some(token)) = (
                file["file_name"].as_str(),
                file["fid"].as_str(),
                file["share_fid_token"].as_str(),
            ) {
                files.push((
                    name.to_string(),
                    fid.to_string(),
                    token.to_string(),
                    file["size"].as_f64().unwrap_or(0.0),
                ));
            }
        }
        if files.is_empty() {
            return Err(Error::Transfer(format!("share {url} has no usable files")));
        }

        let dir = self.topic_dir(task.topic_id);
        let to_pdir_fid = match self.dir_fid(&dir).await? {
            Some(fid) => fid,
            None => self.mkdir(&dir).await?,
        };

        // Skip files already saved with the same size.
        let existing = self.list_dir(&to_pdir_fid).await?;
        files.retain(|(name, _, _, size)| {
            !existing
                .iter()
                .any(|(ename, esize)| ename == name && esize == size)
        });
        if files.is_empty() {
            return Err(Error::Transfer("all files already saved".to_string()));
        }

        let fid_list: Vec<&str> = files.iter().map(|f| f.1.as_str()).collect();
        let fid_token_list: Vec<&str> = files.iter().map(|f| f.2.as_str()).collect();
        let saved = self
            .post(
                "/1/clouddrive/share/sharepage/save",
                &json!({
                    "fid_list": fid_list,
                    "fid_token_list": fid_token_list,
                    "to_pdir_fid": to_pdir_fid,
                    "pwd_id": pwd_id,
                    "stoken": stoken,
                    "pdir_fid": "0",
                    "scene": "link",
                }),
            )
            .await?;
        if saved["code"].as_f64().unwrap_or(-1.0) != 0.0 {
            return Err(Error::Transfer(format!(
                "quark save failed: {}",
                saved["message"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(())
    }

    async fn do_delete(&self, task: &PanTask) -> Result<()> {
        let dir = self.topic_dir(task.topic_id);
        let Some(fid) = self.dir_fid(&dir).await? else {
            return Ok(());
        };
        let deleted = self
            .post(
                "/1/clouddrive/file/delete",
                &json!({ "action_type": 2, "filelist": [fid], "exclude_fids": [] }),
            )
            .await?;
        if deleted["code"].as_f64().unwrap_or(-1.0) != 0.0 {
            return Err(Error::Transfer(format!(
                "quark delete failed: {}",
                deleted["message"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(())
    }

    /// fid of an existing drive path, if it exists.
    async fn dir_fid(&self, dir: &str) -> Result<Option<String>> {
        let data = self
            .post(
                "/1/clouddrive/file/info/path_list",
                &json!({ "file_path": [dir] }),
            )
            .await?;
        Ok(data["data"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|f| f["fid"].as_str())
            .map(|s| s.to_string()))
    }

    async fn mkdir(&self, dir: &str) -> Result<String> {
        let made = self
            .post(
                "/1/clouddrive/file",
                &json!({ "pdir_fid": "0", "file_name": "", "dir_path": dir, "dir_init_lock": false }),
            )
            .await?;
        if made["code"].as_f64().unwrap_or(-1.0) != 0.0 {
            return Err(Error::Transfer(format!(
                "quark mkdir {dir} failed: {}",
                made["message"].as_str().unwrap_or("unknown")
            )));
        }
        made["data"]["fid"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Transfer("quark mkdir returned no fid".to_string()))
    }

    /// (name, size) pairs inside a directory.
    async fn list_dir(&self, fid: &str) -> Result<Vec<(String, f64)>> {
        let data = self
            .get(
                "/1/clouddrive/file/sort",
                &[
                    ("pr", "ucpro"),
                    ("fr", "pc"),
                    ("pdir_fid", fid),
                    ("_page", "1"),
                    ("_size", "100"),
                ],
            )
            .await?;
        let empty = Vec::new();
        Ok(data["data"]["list"]
            .as_array()
            .unwrap_or(&empty)
            .iter()
            .filter_map(|f| {
                Some((
                    f["file_name"].as_str()?.to_string(),
                    f["size"].as_f64().unwrap_or(0.0),
                ))
            })
            .collect())
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("Cookie", &self.cookie)
            .header("User-Agent", QUARK_UA)
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .query(&[("pr", "ucpro"), ("fr", "pc")])
            .header("Cookie", &self.cookie)
            .header("User-Agent", QUARK_UA)
            .json(body)
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    fn sender(&self) -> Result<mpsc::Sender<PanTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::ShuttingDown)
    }
}

#[async_trait]
impl Pan for Quark {
    fn name(&self) -> &'static str {
        "quark"
    }

    fn transfer_type(&self) -> TransferType {
        self.cfg.transfer
    }

    fn supports(&self, record: &TransferRecord) -> bool {
        record.url.contains("pan.quark.cn")
    }

    async fn transfer(&self, topic_id: TopicId, record: TransferRecord) -> Result<()> {
        if record.tqm.is_empty() && !record.url.contains("?pwd=") {
            tracing::debug!(url = %record.url, "quark share has no extract code");
        }
        self.sender()?
            .send(PanTask {
                topic_id,
                record,
                op: PanOp::Save,
            })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    async fn operate(&self, topic_id: TopicId, record: TransferRecord, op: PanOp) -> Result<()> {
        self.sender()?
            .send(PanTask {
                topic_id,
                record,
                op,
            })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    async fn close(&self) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn quark_against(server: &MockServer) -> Arc<Quark> {
        Mock::given(method("GET"))
            .and(path("/1/clouddrive/member/info"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"nickname": "tester"}})),
            )
            .mount(server)
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        Quark::open(
            QuarkCfg {
                root: PathBuf::from("."),
                transfer: TransferType::Auto,
                directory: String::new(),
                cookie: "kps=abc".into(),
                base_url: server.uri(),
            },
            tx,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_pwd_id_extraction() {
        let caps = PWD_ID_RE
            .captures("https://pan.quark.cn/s/ab12cd34?pwd=xyz")
            .unwrap();
        assert_eq!(&caps[1], "ab12cd34");
    }

    #[tokio::test]
    async fn test_open_verifies_login_and_defaults_directory() {
        let server = MockServer::start().await;
        let quark = quark_against(&server).await;
        assert_eq!(quark.cfg.directory, DEFAULT_DIRECTORY);
        assert_eq!(quark.topic_dir(TopicId(7)), "来自：分享/7");
    }

    #[tokio::test]
    async fn test_open_rejects_logged_out_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1/clouddrive/member/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Quark::open(
            QuarkCfg {
                root: PathBuf::from("."),
                transfer: TransferType::Auto,
                directory: String::new(),
                cookie: "kps=abc".into(),
                base_url: server.uri(),
            },
            tx,
        )
        .await;
        assert!(matches!(result, Err(Error::Transfer(_))));
    }

    #[tokio::test]
    async fn test_do_transfer_rejects_dead_share() {
        let server = MockServer::start().await;
        let quark = quark_against(&server).await;
        Mock::given(method("POST"))
            .and(path("/1/clouddrive/share/sharepage/token"))
            .and(body_partial_json(json!({"pwd_id": "abcd"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;

        let task = PanTask {
            topic_id: TopicId(1),
            record: TransferRecord {
                url: "https://pan.quark.cn/s/abcd".into(),
                ..Default::default()
            },
            op: PanOp::Save,
        };
        let err = quark.do_transfer(&task).await;
        assert!(matches!(err, Err(Error::Transfer(_))));
    }
}
