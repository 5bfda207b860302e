//! Shared fixtures for mirror tests.

use super::Mirror;
use crate::config::Config;
use crate::downloader::{DownOutcome, Downloader, NetConfig};
use crate::topic::POST_MARKDOWN;
use crate::types::TopicId;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Stub that "downloads" by writing a plausible post.md, then succeeds.
pub(crate) struct SuccessDownloader {
    pub(crate) calls: AtomicUsize,
}

impl SuccessDownloader {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Downloader for SuccessDownloader {
    async fn download(&self, id: TopicId, workdir: &Path) -> DownOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let post = format!(
            "# topic {id}\n\n\\<pid:0\\> 2024-05-01 08:00:00 by stub-author<\n\nbody\n"
        );
        std::fs::write(workdir.join(POST_MARKDOWN), post).expect("stub write post.md");
        std::fs::write(
            workdir.join("process.ini"),
            "[local]\nmax_page = 2\nmax_floor = 30\n",
        )
        .expect("stub write process.ini");
        DownOutcome {
            success: true,
            message: String::new(),
        }
    }
}

/// Stub that always fails with a fixed downloader-style message.
pub(crate) struct FailingDownloader;

#[async_trait]
impl Downloader for FailingDownloader {
    async fn download(&self, _id: TopicId, _workdir: &Path) -> DownOutcome {
        DownOutcome {
            success: false,
            message: "返回代码不为 200".to_string(),
        }
    }
}

/// Stub that signals when the worker reaches it, then never completes.
/// Simulates a stalled worker for queue-bound tests.
pub(crate) struct BlockingDownloader {
    pub(crate) started: Notify,
}

impl BlockingDownloader {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
        })
    }
}

#[async_trait]
impl Downloader for BlockingDownloader {
    async fn download(&self, _id: TopicId, _workdir: &Path) -> DownOutcome {
        self.started.notify_one();
        std::future::pending().await
    }
}

/// A mirror over a temp topic root with the given downloader and queue size.
pub(crate) async fn create_test_mirror(
    downloader: Arc<dyn Downloader>,
    queue_capacity: usize,
) -> (Mirror, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.downloader.topic_root = Some(temp.path().to_path_buf());
    config.schedule.queue_capacity = queue_capacity;
    let mirror = Mirror::new(config, NetConfig::default(), downloader)
        .await
        .expect("test mirror");
    (mirror, temp)
}
