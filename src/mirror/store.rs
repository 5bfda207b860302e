//! Topic store loading and cron registration.

use super::Mirror;
use crate::topic::Topic;
use crate::types::{Metadata, TopicId};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cron entries further away than this get a one-off jitter refresh
const JITTER_THRESHOLD: Duration = Duration::from_secs(30 * 60);

impl Mirror {
    /// Load every directory under the topic root whose name parses as an id.
    ///
    /// Load failures are logged and skipped. For each loaded topic that is
    /// scheduled and not abandoned, a cron entry is registered; topics whose
    /// first fire is far away additionally get a randomised one-off refresh
    /// so a restart does not leave stale mirrors stale for hours, and all
    /// topics do not pile onto their shared cron boundary.
    pub(crate) async fn load_topics(&self) {
        let entries = match self.inner.topic_root.read_dir() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "cannot read topic root");
                return;
            }
        };

        for entry in entries {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = name.parse::<i64>() else {
                tracing::debug!(dir = %name, "not a topic directory");
                continue;
            };

            let topic = match Topic::load(&self.inner.topic_root, TopicId(id)) {
                Ok(topic) => Arc::new(topic),
                Err(e) => {
                    tracing::warn!(topic = id, error = %e, "failed to load topic");
                    continue;
                }
            };
            self.inner.topics.put(id, topic.clone());

            let next = {
                let mut meta = topic.lock_meta().await;
                if meta.abandon {
                    tracing::info!(topic = id, "topic is abandoned, not scheduling");
                    continue;
                }
                self.register_cron(topic.id, &mut meta)
            };
            if let Some(next) = next {
                self.schedule_jitter(&topic, next);
            }
        }
        tracing::info!(count = self.inner.topics.size(), "topics loaded");
    }

    /// (Re)register the refresh cron entry for a topic.
    ///
    /// The caller holds the topic's metadata lock and passes the guarded
    /// metadata in. Any previous entry is removed first; an empty expression
    /// or the abandon flag leaves the topic unscheduled with handle 0.
    /// Returns the first fire time of the new entry.
    pub(crate) fn register_cron(
        &self,
        id: TopicId,
        meta: &mut Metadata,
    ) -> Option<DateTime<Utc>> {
        self.inner.scheduler.remove(meta.cron_handle);
        meta.cron_handle = 0;

        if meta.update_cron.is_empty() || meta.abandon {
            return None;
        }

        let queue_tx = self.inner.queue_tx.clone();
        let expr = meta.update_cron.clone();
        tracing::debug!(topic = id.0, cron = %expr, "registering refresh cron");
        match self.inner.scheduler.add(
            &expr,
            Arc::new(move || {
                tracing::debug!(topic = id.0, "cron tick, enqueueing refresh");
                if queue_tx.try_send(id.0).is_err() {
                    tracing::warn!(topic = id.0, "refresh queue full, dropping cron tick");
                }
            }),
        ) {
            Ok(handle) => {
                meta.cron_handle = handle;
                self.inner.scheduler.preview_next(&expr).ok().flatten()
            }
            Err(e) => {
                // Load path only: the lifecycle API validates before merging.
                tracing::warn!(topic = id.0, error = %e, "cron registration failed");
                None
            }
        }
    }

    /// Schedule a one-off refresh at a uniformly random point in the first
    /// half of the wait for `next`, when that wait exceeds 30 minutes.
    pub(crate) fn schedule_jitter(&self, topic: &Arc<Topic>, next: DateTime<Utc>) {
        let until = match (next - Utc::now()).to_std() {
            Ok(d) if d > JITTER_THRESHOLD => d,
            _ => return,
        };
        let delay = {
            let mut rng = rand::thread_rng();
            Duration::from_secs(rng.gen_range(0..until.as_secs() / 2))
        };
        tracing::debug!(topic = topic.id.0, delay_secs = delay.as_secs(), "jitter refresh scheduled");
        self.schedule_one_shot(topic, delay);
    }

    /// One-shot refresh timer, registered on the topic so delete/update can
    /// cancel it.
    pub(crate) fn schedule_one_shot(&self, topic: &Arc<Topic>, delay: Duration) {
        let token = CancellationToken::new();
        let key = delay.as_secs();
        topic.add_timer(key, token.clone());

        let queue_tx = self.inner.queue_tx.clone();
        let weak = Arc::downgrade(topic);
        let id = topic.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if queue_tx.try_send(id.0).is_err() {
                        tracing::warn!(topic = id.0, "refresh queue full, dropping timer refresh");
                    }
                    if let Some(topic) = weak.upgrade() {
                        topic.remove_timer(key);
                    }
                }
            }
        });
    }
}
