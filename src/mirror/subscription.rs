//! The author subscription control loop.
//!
//! Each subscribed author gets a half-hourly poll of their thread list; any
//! thread newer than what the store already holds, and passing the author's
//! title filter, is enrolled through the normal add path. On startup every
//! subscription additionally gets a one-shot poll at a random offset within
//! ten minutes, so a restart does not burst the forum with list fetches.

use super::{Mirror, SubHandles};
use crate::error::{Error, Result};
use crate::types::UserRecord;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Subscription poll cadence
const POLL_CRON: &str = "@every 30m";
/// Post-boot polls spread uniformly inside this window
const BOOT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Does a title pass an author filter?
///
/// Each entry is either a plain substring or a `+`-joined conjunction of
/// substrings; entries are OR-combined and matching is case-insensitive.
/// An absent or empty filter accepts everything.
pub fn filter_match(filter: &Option<Vec<String>>, title: &str) -> bool {
    let Some(entries) = filter else {
        return true;
    };
    if entries.is_empty() {
        return true;
    }
    let title = title.to_lowercase();
    entries.iter().any(|entry| {
        entry
            .split('+')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .all(|part| title.contains(&part.to_lowercase()))
    })
}

impl Mirror {
    /// Schedule polls for every already-subscribed author.
    pub(crate) fn start_subscriptions(&self) {
        for user in self.inner.users.subscribed() {
            if let Err(e) = self.schedule_subscription(user.id) {
                tracing::warn!(uid = user.id, error = %e, "scheduling subscription failed");
            }
        }
    }

    /// Subscribe to an author (looked up by uid), with an optional filter.
    pub async fn subscribe(&self, uid: i64, filter: Option<Vec<String>>) -> Result<UserRecord> {
        let mut user = self.inner.users.by_uid(uid).await?;
        user.subscribed = true;
        user.filter = filter;
        self.inner.users.put(user.clone()).await?;
        if !self.inner.sub_handles.has(&uid) {
            self.schedule_subscription(uid)?;
        }
        tracing::info!(uid, name = %user.name, "author subscribed");
        Ok(user)
    }

    /// Unsubscribe from an author, cancelling the poll handles.
    pub async fn unsubscribe(&self, uid: i64) -> Result<()> {
        if let Some(handles) = self.inner.sub_handles.delete(&uid) {
            self.inner.scheduler.remove(handles.cron);
            handles.boot.cancel();
        }
        if let Some(mut user) = self.inner.users.get(uid) {
            user.subscribed = false;
            self.inner.users.put(user).await?;
        }
        tracing::info!(uid, "author unsubscribed");
        Ok(())
    }

    /// Whether an author is currently subscribed.
    pub fn is_subscribed(&self, uid: i64) -> bool {
        self.inner
            .users
            .get(uid)
            .map(|u| u.subscribed)
            .unwrap_or(false)
    }

    fn schedule_subscription(&self, uid: i64) -> Result<()> {
        let poller = self.clone();
        let cron = self.inner.scheduler.add(
            POLL_CRON,
            Arc::new(move || {
                let mirror = poller.clone();
                tokio::spawn(async move {
                    mirror.poll_author(uid).await;
                });
            }),
        )?;

        let boot = CancellationToken::new();
        let delay = {
            let mut rng = rand::thread_rng();
            Duration::from_secs(rng.gen_range(0..BOOT_WINDOW.as_secs()))
        };
        let mirror = self.clone();
        let boot_wait = boot.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = boot_wait.cancelled() => {}
                _ = tokio::time::sleep(delay) => mirror.poll_author(uid).await,
            }
        });

        self.inner
            .sub_handles
            .put(uid, Arc::new(SubHandles { cron, boot }));
        Ok(())
    }

    /// One poll: fetch the author's thread list and enrol what is new.
    pub(crate) async fn poll_author(&self, uid: i64) {
        let Some(user) = self.inner.users.get(uid) else {
            tracing::debug!(uid, "no user record, skipping poll");
            return;
        };
        if !user.subscribed {
            return;
        }

        // Newest thread of this author the store already holds.
        let max_id = self
            .inner
            .topics
            .values()
            .into_iter()
            .filter(|t| t.state().author == user.name)
            .map(|t| t.id.0)
            .max()
            .unwrap_or(0);

        let rows = match self.inner.users.fetch_author_topics(uid).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(uid, error = %e, "author thread list fetch failed");
                return;
            }
        };

        for row in rows {
            if row.missing {
                tracing::debug!(topic = row.id, "thread inaccessible, skipping");
                continue;
            }
            if row.id <= max_id {
                continue;
            }
            if !filter_match(&user.filter, &row.title) {
                tracing::debug!(topic = row.id, title = %row.title, "filtered out");
                continue;
            }
            match self.add_topic(row.id).await {
                Ok(()) => {
                    tracing::info!(uid, topic = row.id, title = %row.title, "enrolled new thread");
                }
                Err(Error::TopicExists(_)) => {}
                Err(e) => tracing::warn!(uid, topic = row.id, error = %e, "enrolling thread failed"),
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_or_of_and_conjunctions() {
        let filter = Some(vec!["a+b".to_string(), "c".to_string()]);
        assert!(filter_match(&filter, "has A and B together"));
        assert!(filter_match(&filter, "only C here"));
        assert!(!filter_match(&filter, "just a alone"));
        assert!(!filter_match(&filter, "just b alone"));
        assert!(!filter_match(&filter, "nothing relevant"));
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let filter = Some(vec!["合集+TXT".to_string()]);
        assert!(filter_match(&filter, "某合集 txt 版"));
        assert!(!filter_match(&filter, "某合集 epub 版"));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        assert!(filter_match(&None, "anything"));
        assert!(filter_match(&Some(vec![]), "anything"));
    }
}
