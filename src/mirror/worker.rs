//! The refresh worker.
//!
//! One worker drains the refresh queue sequentially, so downloads never
//! overlap: not for the same topic, and (the downloader being a heavyweight
//! exclusive child process) not for different topics either. Duplicate ids
//! in the queue are harmless: each pass re-reads current state.

use super::Mirror;
use crate::topic::{ASSETS_JSON, PROCESS_INI, Topic};
use crate::types::{DownResult, TopicId};
use chrono::Utc;
use std::sync::Arc;

/// Default `process.ini` for a directory the downloader has not seen yet;
/// without it (and the manifest) the downloader refuses the topic.
const DEFAULT_PROCESS_INI: &str = "[local]\nmax_page = 1\nmax_floor = -1";

impl Mirror {
    /// Spawn the single refresh worker.
    pub(crate) fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
        let mirror = self.clone();
        let mut rx = match self.take_queue_rx() {
            Some(rx) => rx,
            None => {
                tracing::error!("refresh worker already started");
                return tokio::spawn(async {});
            }
        };
        tokio::spawn(async move {
            tracing::info!("refresh worker started");
            loop {
                tokio::select! {
                    _ = mirror.inner.shutdown.cancelled() => break,
                    id = rx.recv() => match id {
                        Some(id) => mirror.process(id).await,
                        None => break,
                    },
                }
            }
            tracing::info!("refresh worker stopped");
        })
    }

    /// Run one refresh: invoke the downloader and reconcile topic state.
    pub(crate) async fn process(&self, id: i64) {
        let Some(old) = self.inner.topics.get(&id) else {
            tracing::info!(topic = id, "queued topic no longer in store, skipping");
            return;
        };
        let title = old.state().title;
        if title.is_empty() {
            tracing::info!(topic = id, "refreshing topic");
        } else {
            tracing::info!(topic = id, title = %title, "refreshing topic");
        }

        // The downloader treats a directory without its sidecars as invalid,
        // so make sure both exist before invoking it.
        let dir = old.root();
        if !dir.is_exist(PROCESS_INI)
            && let Err(e) = dir.write_all(PROCESS_INI, DEFAULT_PROCESS_INI.as_bytes())
        {
            tracing::warn!(topic = id, error = %e, "cannot create {PROCESS_INI}");
        }
        if !dir.is_exist(ASSETS_JSON)
            && let Err(e) = dir.write_all(ASSETS_JSON, b"{}")
        {
            tracing::warn!(topic = id, error = %e, "cannot create {ASSETS_JSON}");
        }

        let outcome = self
            .inner
            .downloader
            .download(TopicId(id), &dir.abs_path())
            .await;

        if outcome.success {
            self.reconcile_success(id, &old).await;
        } else {
            self.reconcile_failure(id, &old, outcome.message).await;
        }
    }

    /// Successful download: replace the store entry with a fresh record
    /// loaded from disk, then fan out to the transfer and repair pipelines.
    async fn reconcile_success(&self, id: i64, old: &Arc<Topic>) {
        let fresh = match Topic::load(&self.inner.topic_root, TopicId(id)) {
            Ok(fresh) => Arc::new(fresh),
            Err(e) => {
                tracing::error!(topic = id, error = %e, "reload after download failed");
                return;
            }
        };

        // The fresh record inherits the live scheduling state: the cron
        // handle keeps pointing at its registered entry and pending one-shot
        // timers survive the swap.
        {
            let old_meta = old.lock_meta().await;
            let mut meta = fresh.lock_meta().await;
            meta.cron_handle = old_meta.cron_handle;
            meta.retry_count = 0;
        }
        old.transfer_timers_to(&fresh);
        fresh.set_result(DownResult {
            success: true,
            message: String::new(),
            time: Some(Utc::now()),
        });
        fresh.set_uid_if_zero(old.state().uid);

        self.inner.topics.put(id, fresh.clone());

        // Fill the author uid lazily from the user cache.
        let author = fresh.state().author;
        if !author.is_empty() && fresh.state().uid == 0 {
            let users = self.inner.users.clone();
            let topic = fresh.clone();
            tokio::spawn(async move {
                match users.by_name(&author).await {
                    Ok(user) => topic.set_uid_if_zero(user.id),
                    Err(e) => tracing::debug!(author, error = %e, "uid backfill failed"),
                }
            });
        }

        if let Some(pans) = self.pans() {
            let pans = pans.clone();
            let topic = fresh.clone();
            tokio::spawn(async move {
                pans.auto_transfer(&topic).await;
            });
        }

        self.inner
            .repairer
            .scan_topic(&fresh, self.inner.net.use_network_pic_url);
    }

    /// Failed download: record the message and spend the retry budget.
    ///
    /// `max_retry_count < 0` skips the budget entirely (never abandon);
    /// otherwise the topic abandons once `retry_count` reaches the effective
    /// limit: its cron entry is removed and the metadata persisted so the
    /// abandonment survives a restart.
    async fn reconcile_failure(&self, id: i64, topic: &Arc<Topic>, message: String) {
        tracing::warn!(topic = id, message = %message, "download failed");
        topic.set_result(DownResult {
            success: false,
            message,
            time: Some(Utc::now()),
        });

        let abandoned = {
            let mut meta = topic.lock_meta().await;
            let Some(limit) = meta.effective_max_retry() else {
                return;
            };
            meta.retry_count += 1;
            tracing::info!(topic = id, retry = meta.retry_count, limit, "retry budget spent");
            if meta.retry_count < limit {
                false
            } else {
                tracing::warn!(topic = id, "retry budget exhausted, abandoning");
                self.inner.scheduler.remove(meta.cron_handle);
                meta.cron_handle = 0;
                meta.abandon = true;
                true
            }
        };

        if abandoned {
            let topic = topic.clone();
            tokio::spawn(async move {
                if let Err(e) = topic.save_meta().await {
                    tracing::warn!(topic = topic.id.0, error = %e, "persisting abandon failed");
                }
            });
        }
    }
}
