//! Topic lifecycle operations exposed to the HTTP layer.

use super::Mirror;
use super::recycle::{DELETE_FLAG, DIR_RECYCLE_BIN};
use crate::error::{Error, Result};
use crate::sandbox::RootDir;
use crate::schedule::CronScheduler;
use crate::topic::Topic;
use crate::types::{Metadata, TopicId};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Default refresh cadence for newly added topics
pub const DEFAULT_CRON: &str = "@every 1h";

/// Fast-start offsets: one-shot refreshes that fill a fresh topic in quickly,
/// independent of the hourly cron cadence
const FAST_START_MINUTES: [u64; 5] = [5, 10, 15, 25, 40];

impl Mirror {
    /// Add a topic: create the record, enqueue the first download, register
    /// the default cron, and schedule the fast-start timers.
    pub async fn add_topic(&self, id: i64) -> Result<()> {
        if id <= 0 {
            return Err(Error::InvalidTopicId(id.to_string()));
        }
        if self.inner.topics.has(&id) {
            return Err(Error::TopicExists(id));
        }
        // Queue admission first: a full queue must not leave a half-created
        // record behind.
        self.inner
            .queue_tx
            .try_send(id)
            .map_err(|_| Error::QueueFull)?;

        let dir = self.inner.topic_root.open_sub(id.to_string())?;
        let topic = Arc::new(Topic::new(
            dir,
            TopicId(id),
            Metadata {
                update_cron: DEFAULT_CRON.to_string(),
                ..Default::default()
            },
        ));

        {
            let mut meta = topic.lock_meta().await;
            self.register_cron(topic.id, &mut meta);
        }
        self.inner.topics.put(id, topic.clone());

        for minutes in FAST_START_MINUTES {
            self.schedule_one_shot(&topic, Duration::from_secs(minutes * 60));
        }

        let persist = topic.clone();
        tokio::spawn(async move {
            if let Err(e) = persist.save_meta().await {
                tracing::warn!(topic = persist.id.0, error = %e, "persisting new topic failed");
            }
        });

        tracing::info!(topic = id, "topic added");
        Ok(())
    }

    /// Soft-delete a topic: evict it, cancel its timers and cron entry, and
    /// move its directory into the recycle bin in the background.
    pub async fn delete_topic(&self, id: i64) -> Result<()> {
        let topic = self
            .inner
            .topics
            .delete(&id)
            .ok_or(Error::TopicNotFound(id))?;
        self.detach(&topic).await;

        let topic_root = self.inner.topic_root.clone();
        tokio::spawn(async move {
            move_to_recycle(&topic_root, id);
        });

        tracing::info!(topic = id, "topic deleted");
        Ok(())
    }

    /// Merge new metadata onto a topic, re-validating and re-registering its
    /// cron entry and cancelling any fast-start timers.
    ///
    /// This is also the only way back from the abandoned state: a merge that
    /// clears the flag (or rewrites the cron) restores scheduling.
    pub async fn update_topic(&self, id: i64, update: Metadata) -> Result<()> {
        let topic = self.inner.topics.get(&id).ok_or(Error::TopicNotFound(id))?;
        if !update.update_cron.is_empty() {
            CronScheduler::validate(&update.update_cron)?;
        }

        {
            let mut meta = topic.lock_meta().await;
            meta.merge(&update);
            self.register_cron(topic.id, &mut meta);
        }
        topic.cancel_timers();
        topic.touch();

        let persist = topic.clone();
        tokio::spawn(async move {
            if let Err(e) = persist.save_meta().await {
                tracing::warn!(topic = persist.id.0, error = %e, "persisting metadata failed");
            }
        });

        tracing::info!(topic = id, "topic metadata updated");
        Ok(())
    }

    /// Delete then re-add: re-download the topic from scratch.
    ///
    /// The recycle move happens synchronously here so the fresh download
    /// cannot race the rename of its own directory.
    pub async fn force_reload(&self, id: i64) -> Result<()> {
        let topic = self
            .inner
            .topics
            .delete(&id)
            .ok_or(Error::TopicNotFound(id))?;
        self.detach(&topic).await;
        move_to_recycle(&self.inner.topic_root, id);
        self.add_topic(id).await
    }

    /// Enqueue a one-off refresh.
    pub fn refresh(&self, id: i64) -> Result<()> {
        if !self.inner.topics.has(&id) {
            return Err(Error::TopicNotFound(id));
        }
        self.inner
            .queue_tx
            .try_send(id)
            .map_err(|_| Error::QueueFull)
    }

    /// Cancel a topic's scheduling state on eviction.
    async fn detach(&self, topic: &Arc<Topic>) {
        let handle = {
            let meta = topic.lock_meta().await;
            meta.cron_handle
        };
        self.inner.scheduler.remove(handle);
        topic.close();
    }
}

/// Move a topic directory into `recycles/<id>` and stamp it with the
/// deletion time. A stale entry of the same id is replaced; if the recycle
/// bin itself cannot be created the directory is removed outright.
pub(crate) fn move_to_recycle(topic_root: &RootDir, id: i64) {
    let name = id.to_string();
    if !topic_root.is_exist(&name) {
        tracing::debug!(topic = id, "no directory to recycle");
        return;
    }
    let source = match topic_root.abs_path_of(&name) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(topic = id, error = %e, "bad topic path");
            return;
        }
    };

    let recycles = match topic_root.open_sub(DIR_RECYCLE_BIN) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(topic = id, error = %e, "cannot create recycle bin, removing outright");
            if let Err(e) = topic_root.remove_all(&name) {
                tracing::error!(topic = id, error = %e, "removing topic dir failed");
            }
            return;
        }
    };

    if let Err(e) = recycles.remove_all(&name) {
        tracing::warn!(topic = id, error = %e, "removing stale recycle entry failed");
    }
    let target = match recycles.abs_path_of(&name) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(topic = id, error = %e, "bad recycle path");
            return;
        }
    };
    if let Err(e) = std::fs::rename(&source, &target) {
        tracing::error!(topic = id, error = %e, "moving topic dir to recycle bin failed");
        return;
    }
    let flag = format!("{name}/{DELETE_FLAG}");
    if let Err(e) = recycles.write_all(&flag, Utc::now().to_rfc3339().as_bytes()) {
        tracing::warn!(topic = id, error = %e, "writing {DELETE_FLAG} failed");
    }
    tracing::info!(topic = id, "topic moved to recycle bin");
}
