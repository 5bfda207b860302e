//! Baidu netdisk provider
//!
//! Wraps the BaiduPCS-Go command-line client. The CLI keeps its own login
//! state under its config directory; this provider only drives it: one task
//! at a time through a serial worker, `transfer` for saves, `rm` for deletes,
//! and a daily self-update tick at 02:00.

use super::provider::{Pan, PanTask, PROVIDER_QUEUE_SIZE, TransferUpdate, UpdateSender};
use crate::error::{Error, Result};
use crate::schedule::CronScheduler;
use crate::types::{PanOp, TopicId, TransferRecord, TransferStatus, TransferType};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;

/// CLI binary name inside the provider's config directory
const BAIDU_PCS_NAME: &str = "BaiduPCS-Go";
/// Environment variable the CLI reads its config directory from
const BAIDU_PCS_CONFIG_DIR: &str = "BAIDUPCS_GO_CONFIG_DIR";
/// Default save directory in the netdisk
const DEFAULT_DIRECTORY: &str = "/我的资源";

/// Baidu provider configuration (`[baidu]` section of the pan config)
#[derive(Clone, Debug)]
pub struct BaiduCfg {
    /// Working directory holding the CLI binary and its config
    pub root: PathBuf,
    /// auto or manual transfer
    pub transfer: TransferType,
    /// Save directory in the netdisk (default `/我的资源`)
    pub directory: String,
    /// Login credential, used once when the CLI is not yet logged in
    pub bduss: String,
    /// Login credential companion
    pub stoken: String,
}

/// BaiduPCS-Go wrapper
pub struct Baidu {
    cfg: BaiduCfg,
    program: PathBuf,
    tasks: std::sync::Mutex<Option<mpsc::Sender<PanTask>>>,
    /// The CLI shares on-disk state; never run it concurrently
    cli_lock: tokio::sync::Mutex<()>,
}

impl Baidu {
    /// Check the binary, ensure a login, start the task worker, and register
    /// the daily self-update tick.
    pub async fn open(
        mut cfg: BaiduCfg,
        updates: UpdateSender,
        scheduler: &Arc<CronScheduler>,
    ) -> Result<Arc<Self>> {
        if cfg.directory.is_empty() {
            cfg.directory = DEFAULT_DIRECTORY.to_string();
        }
        let program = cfg.root.join(BAIDU_PCS_NAME);
        if !program.is_file() {
            return Err(Error::Transfer(format!(
                "{} not found in {}",
                BAIDU_PCS_NAME,
                cfg.root.display()
            )));
        }

        let (tx, rx) = mpsc::channel(PROVIDER_QUEUE_SIZE);
        let baidu = Arc::new(Self {
            cfg,
            program,
            tasks: std::sync::Mutex::new(Some(tx)),
            cli_lock: tokio::sync::Mutex::new(()),
        });

        baidu.ensure_login().await?;
        match baidu.run(&["-v"]).await {
            Ok(v) => tracing::info!(version = v.lines().next().unwrap_or(""), "baidu CLI ready"),
            Err(e) => tracing::warn!(error = %e, "baidu CLI version probe failed"),
        }

        baidu.clone().spawn_worker(rx, updates);

        // Keep the CLI current: binary updates fix the forum-side API drift
        // that otherwise breaks transfers silently.
        let update_target = Arc::downgrade(&baidu);
        scheduler.add(
            "0 2 * * *",
            Arc::new(move || {
                if let Some(baidu) = update_target.upgrade() {
                    tokio::spawn(async move {
                        match baidu.run(&["update", "-y"]).await {
                            Ok(_) => tracing::info!("baidu CLI update finished"),
                            Err(e) => tracing::warn!(error = %e, "baidu CLI update failed"),
                        }
                    });
                }
            }),
        )?;

        Ok(baidu)
    }

    async fn ensure_login(&self) -> Result<()> {
        let who = self.run(&["who"]).await?;
        if !who.contains("uid: 0") && who.contains("uid:") {
            return Ok(());
        }
        if self.cfg.bduss.is_empty() {
            return Err(Error::Transfer(
                "baidu CLI is not logged in and no bduss configured".to_string(),
            ));
        }
        tracing::info!("logging baidu CLI in with configured bduss");
        let bduss = format!("-bduss={}", self.cfg.bduss);
        let mut args = vec!["login", bduss.as_str()];
        let stoken = format!("-stoken={}", self.cfg.stoken);
        if !self.cfg.stoken.is_empty() {
            args.push(stoken.as_str());
        }
        let out = self.run(&args).await?;
        if out.contains("登录成功") || out.contains("登录百度帐号成功") {
            Ok(())
        } else {
            Err(Error::Transfer(format!("baidu login failed: {}", tail(&out))))
        }
    }

    fn spawn_worker(self: Arc<Self>, mut rx: mpsc::Receiver<PanTask>, updates: UpdateSender) {
        tokio::spawn(async move {
            tracing::debug!("baidu task worker started");
            while let Some(task) = rx.recv().await {
                let result = match task.op {
                    PanOp::Save => self.do_transfer(&task).await,
                    PanOp::Delete => self.do_delete(&task).await,
                };
                let (status, message) = match (&result, task.op) {
                    (Ok(()), PanOp::Save) => (TransferStatus::Success, String::new()),
                    // A deleted save is simply "not saved yet" again.
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
            tracing::debug!("baidu task worker stopped");
        });
    }

    fn topic_dir(&self, topic_id: TopicId) -> String {
        format!("{}/{}", self.cfg.directory, topic_id)
    }

    async fn do_transfer(&self, task: &PanTask) -> Result<()> {
        let dir = self.topic_dir(task.topic_id);
        tracing::debug!(topic = task.topic_id.0, url = %task.record.url, "baidu transfer");

        // mkdir fails harmlessly when the directory already exists.
        let _ = self.run(&["mkdir", &dir]).await;
        self.run(&["cd", &dir]).await?;

        let mut args = vec!["transfer", task.record.url.as_str()];
        if !task.record.tqm.is_empty() {
            args.push(task.record.tqm.as_str());
        }
        let out = self.run(&args).await?;
        if out.contains("成功") {
            Ok(())
        } else {
            Err(Error::Transfer(format!("baidu transfer failed: {}", tail(&out))))
        }
    }

    async fn do_delete(&self, task: &PanTask) -> Result<()> {
        let dir = self.topic_dir(task.topic_id);
        let out = self.run(&["rm", &dir]).await?;
        if out.contains("失败") {
            Err(Error::Transfer(format!("baidu rm failed: {}", tail(&out))))
        } else {
            Ok(())
        }
    }

    /// Run the CLI with its config dir pinned; combined output is returned
    /// regardless of exit code (the CLI reports real failures in text).
    async fn run(&self, args: &[&str]) -> Result<String> {
        let _guard = self.cli_lock.lock().await;
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.cfg.root)
            .env(BAIDU_PCS_CONFIG_DIR, &self.cfg.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Transfer(format!("failed to spawn {BAIDU_PCS_NAME}: {e}")))?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
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
impl Pan for Baidu {
    fn name(&self) -> &'static str {
        "baidu"
    }

    fn transfer_type(&self) -> TransferType {
        self.cfg.transfer
    }

    fn supports(&self, record: &TransferRecord) -> bool {
        record.url.contains("pan.baidu.com")
    }

    async fn transfer(&self, topic_id: TopicId, record: TransferRecord) -> Result<()> {
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
        // Dropping the sender lets the worker drain and exit.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn tail(out: &str) -> &str {
    out.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_baidu_urls_only() {
        let cfg = BaiduCfg {
            root: PathBuf::from("."),
            transfer: TransferType::Auto,
            directory: DEFAULT_DIRECTORY.into(),
            bduss: String::new(),
            stoken: String::new(),
        };
        let baidu = Baidu {
            cfg,
            program: PathBuf::from("BaiduPCS-Go"),
            tasks: std::sync::Mutex::new(None),
            cli_lock: tokio::sync::Mutex::new(()),
        };
        let rec = |url: &str| TransferRecord {
            url: url.into(),
            ..Default::default()
        };
        assert!(baidu.supports(&rec("https://pan.baidu.com/s/abc")));
        assert!(!baidu.supports(&rec("https://pan.quark.cn/s/abc")));
    }

    #[test]
    fn test_topic_dir_layout() {
        let baidu = Baidu {
            cfg: BaiduCfg {
                root: PathBuf::from("."),
                transfer: TransferType::Auto,
                directory: "/我的资源".into(),
                bduss: String::new(),
                stoken: String::new(),
            },
            program: PathBuf::from("BaiduPCS-Go"),
            tasks: std::sync::Mutex::new(None),
            cli_lock: tokio::sync::Mutex::new(()),
        };
        assert_eq!(baidu.topic_dir(TopicId(42)), "/我的资源/42");
    }

    #[test]
    fn test_tail_picks_last_nonempty_line() {
        assert_eq!(tail("a\nb\n\n"), "b");
        assert_eq!(tail(""), "");
    }
}
