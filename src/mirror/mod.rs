//! The mirror core, split into focused submodules.
//!
//! The [`Mirror`] struct ties the scheduling and orchestration core together;
//! its methods are organized by domain:
//! - [`store`] - loading topics from disk and cron registration
//! - [`worker`] - the single refresh worker draining the download queue
//! - [`lifecycle`] - add/delete/update/force-reload and fast-start timers
//! - [`recycle`] - the recycle-bin reaper
//! - [`subscription`] - the author subscription control loop

mod lifecycle;
mod recycle;
mod store;
mod subscription;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use subscription::filter_match;

use crate::collection::SyncMap;
use crate::config::Config;
use crate::downloader::{Downloader, NetConfig};
use crate::error::{Error, Result};
use crate::repair::AssetRepairer;
use crate::sandbox::RootDir;
use crate::schedule::CronScheduler;
use crate::smile::Smile;
use crate::topic::Topic;
use crate::transfer::PanHolder;
use crate::users::UserStore;
use crate::utils::short_sha1;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Subscription handles for one author (cron entry + post-boot timer)
pub(crate) struct SubHandles {
    pub(crate) cron: u64,
    pub(crate) boot: CancellationToken,
}

pub(crate) struct MirrorInner {
    pub(crate) config: Arc<Config>,
    pub(crate) net: NetConfig,
    pub(crate) topic_root: RootDir,
    pub(crate) topics: SyncMap<i64, Arc<Topic>>,
    pub(crate) queue_tx: mpsc::Sender<i64>,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<i64>>>,
    pub(crate) scheduler: Arc<CronScheduler>,
    pub(crate) downloader: Arc<dyn Downloader>,
    pub(crate) users: Arc<UserStore>,
    pub(crate) repairer: AssetRepairer,
    pub(crate) smile: Arc<Smile>,
    pans: OnceLock<Arc<PanHolder>>,
    pub(crate) sub_handles: SyncMap<i64, Arc<SubHandles>>,
    pub(crate) shutdown: CancellationToken,
    stopped: AtomicBool,
    token_hash: String,
}

/// Main mirror instance (cloneable - state is behind one Arc)
#[derive(Clone)]
pub struct Mirror {
    pub(crate) inner: Arc<MirrorInner>,
}

impl Mirror {
    /// Create a mirror instance and load existing topics from disk.
    ///
    /// Long-lived tasks (refresh worker, recycle sweep, subscription polls)
    /// are not started yet; call [`start`](Self::start) once everything is
    /// wired, so tests can drive the worker directly.
    pub async fn new(
        config: Config,
        net: NetConfig,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        let topic_root_path = config.downloader.topic_root.clone().ok_or(Error::Config {
            message: "topic root is not set".to_string(),
            key: Some("downloader.topic_root".to_string()),
        })?;
        let topic_root = RootDir::open(&topic_root_path)?;

        let (queue_tx, queue_rx) = mpsc::channel(config.schedule.queue_capacity);
        let scheduler = Arc::new(CronScheduler::new(&config.schedule.timezone));

        let users = Arc::new(UserStore::open(
            topic_root.open_sub("users")?,
            net.base_url.clone(),
            net.ua.clone(),
            net.cookie(),
        )?);

        let repairer = AssetRepairer::new(config.repair.clone())?;
        let smile = Arc::new(Smile::open(&topic_root)?);

        let token_hash = config
            .server
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(short_sha1)
            .unwrap_or_else(|| "-".to_string());

        let mirror = Self {
            inner: Arc::new(MirrorInner {
                config: Arc::new(config),
                net,
                topic_root,
                topics: SyncMap::new(),
                queue_tx,
                queue_rx: std::sync::Mutex::new(Some(queue_rx)),
                scheduler,
                downloader,
                users,
                repairer,
                smile,
                pans: OnceLock::new(),
                sub_handles: SyncMap::new(),
                shutdown: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                token_hash,
            }),
        };

        mirror.load_topics().await;
        Ok(mirror)
    }

    /// Start the long-lived background tasks: the refresh worker, the
    /// 12-hour recycle sweep, and the subscription polls.
    pub fn start(&self) {
        self.spawn_worker();
        self.register_recycle_sweep();
        self.start_subscriptions();
    }

    /// A topic by id, if present.
    pub fn topic(&self, id: i64) -> Option<Arc<Topic>> {
        self.inner.topics.get(&id)
    }

    /// Every live topic.
    pub fn all_topics(&self) -> Vec<Arc<Topic>> {
        self.inner.topics.values()
    }

    /// The service configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Forum network settings (from the downloader's config).
    pub fn net(&self) -> &NetConfig {
        &self.inner.net
    }

    /// The user-info cache.
    pub fn users(&self) -> &Arc<UserStore> {
        &self.inner.users
    }

    /// The smiley cache.
    pub fn smile(&self) -> &Arc<Smile> {
        &self.inner.smile
    }

    /// The short token hash used in `/view` and `/pan` paths (`-` when the
    /// service runs without a token).
    pub fn token_hash(&self) -> &str {
        &self.inner.token_hash
    }

    /// Attach the transfer providers once they finish their (slow) login.
    pub fn set_pans(&self, pans: PanHolder) {
        if self.inner.pans.set(Arc::new(pans)).is_err() {
            tracing::warn!("pan holder already attached");
        }
    }

    /// Build the transfer providers from a pan config directory and attach
    /// them. Provider login is slow; run this in a background task.
    pub async fn attach_pans(&self, dir: &std::path::Path) -> Result<()> {
        let pans = PanHolder::open(dir, self.inner.topics.clone(), &self.inner.scheduler).await?;
        self.set_pans(pans);
        Ok(())
    }

    /// The transfer providers, if attached.
    pub fn pans(&self) -> Option<&Arc<PanHolder>> {
        self.inner.pans.get()
    }

    /// Token that fires when shutdown begins (HTTP server drains on it).
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Shut everything down in dependency order; idempotent.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down");

        // Scheduler first: nothing new may enter the queues.
        self.inner.scheduler.stop();
        if let Some(pans) = self.inner.pans.get() {
            pans.close().await;
        }
        // Stops the refresh worker and the HTTP server.
        self.inner.shutdown.cancel();

        self.inner.sub_handles.each_and_clear(|_, handles| {
            handles.boot.cancel();
        });
        self.inner.topics.each_and_clear(|_, topic| {
            topic.close();
        });

        tracing::info!("shutdown complete");
    }

    pub(crate) fn take_queue_rx(&self) -> Option<mpsc::Receiver<i64>> {
        self.inner
            .queue_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}
