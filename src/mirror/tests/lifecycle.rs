use crate::error::Error;
use crate::mirror::test_helpers::{FailingDownloader, SuccessDownloader, create_test_mirror};
use crate::types::Metadata;
use std::sync::Arc;
use std::time::Duration;

// --- add ---

#[tokio::test]
async fn test_add_then_duplicate_conflicts() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(43833908).await.unwrap();
    match mirror.add_topic(43833908).await {
        Err(Error::TopicExists(43833908)) => {}
        other => panic!("expected TopicExists, got {other:?}"),
    }
}

#[tokio::test]
async fn test_add_rejects_nonpositive_ids() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    assert!(matches!(
        mirror.add_topic(0).await,
        Err(Error::InvalidTopicId(_))
    ));
    assert!(matches!(
        mirror.add_topic(-3).await,
        Err(Error::InvalidTopicId(_))
    ));
}

#[tokio::test]
async fn test_add_sets_default_cron_and_fast_start_timers() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(1).await.unwrap();
    let topic = mirror.topic(1).unwrap();
    let meta = topic.lock_meta().await;
    assert_eq!(meta.update_cron, "@every 1h");
    assert_ne!(meta.cron_handle, 0);
}

// --- update ---

#[tokio::test]
async fn test_update_rejects_invalid_cron_and_keeps_metadata() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(1).await.unwrap();

    let err = mirror
        .update_topic(
            1,
            Metadata {
                update_cron: "xxx".to_string(),
                ..Default::default()
            },
        )
        .await;
    match err {
        Err(Error::InvalidCron { .. }) => {}
        other => panic!("expected InvalidCron, got {other:?}"),
    }

    let topic = mirror.topic(1).unwrap();
    let meta = topic.lock_meta().await;
    assert_eq!(
        meta.update_cron, "@every 1h",
        "a rejected update must not alter metadata"
    );
}

#[tokio::test]
async fn test_update_reregisters_cron_entry() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(1).await.unwrap();
    let topic = mirror.topic(1).unwrap();
    let old_handle = topic.lock_meta().await.cron_handle;

    mirror
        .update_topic(
            1,
            Metadata {
                update_cron: "@every 5m".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let meta = topic.lock_meta().await;
    assert_eq!(meta.update_cron, "@every 5m");
    assert_ne!(meta.cron_handle, 0);
    assert_ne!(meta.cron_handle, old_handle, "a new entry replaces the old");
}

#[tokio::test]
async fn test_update_empty_cron_disables_scheduling() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(1).await.unwrap();
    mirror
        .update_topic(1, Metadata::default())
        .await
        .unwrap();
    let topic = mirror.topic(1).unwrap();
    assert_eq!(topic.lock_meta().await.cron_handle, 0);
}

#[tokio::test]
async fn test_update_clearing_abandon_restores_scheduling() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(1).await.unwrap();
    mirror
        .update_topic(
            1,
            Metadata {
                update_cron: "@every 1h".to_string(),
                abandon: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(mirror.topic(1).unwrap().lock_meta().await.cron_handle, 0);

    mirror
        .update_topic(
            1,
            Metadata {
                update_cron: "@every 1h".to_string(),
                abandon: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_ne!(mirror.topic(1).unwrap().lock_meta().await.cron_handle, 0);
}

#[tokio::test]
async fn test_update_unknown_topic_is_not_found() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    assert!(matches!(
        mirror.update_topic(9, Metadata::default()).await,
        Err(Error::TopicNotFound(9))
    ));
}

// --- delete / force reload ---

#[tokio::test]
async fn test_delete_moves_directory_to_recycle_bin() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    mirror.add_topic(7).await.unwrap();
    let topic = mirror.topic(7).unwrap();
    topic.root().write_all("post.md", b"# gone soon").unwrap();

    mirror.delete_topic(7).await.unwrap();
    assert!(mirror.topic(7).is_none());
    assert!(topic.is_closed());

    // The move runs in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let root = &mirror.inner.topic_root;
    assert!(!root.is_exist("7"), "topic dir is gone from the root");
    assert!(root.is_exist("recycles/7/post.md"));
    let stamp = root.read_all("recycles/7/deleted_at").unwrap();
    let stamp = String::from_utf8(stamp).unwrap();
    chrono::DateTime::parse_from_rfc3339(stamp.trim()).expect("deleted_at is RFC3339");

    match mirror.delete_topic(7).await {
        Err(Error::TopicNotFound(7)) => {}
        other => panic!("expected TopicNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_force_reload_recreates_from_scratch() {
    let stub = SuccessDownloader::new();
    let (mirror, _temp) = create_test_mirror(stub, 99).await;
    mirror.add_topic(3).await.unwrap();
    let topic = mirror.topic(3).unwrap();
    topic.root().write_all("stale.txt", b"old").unwrap();

    mirror.force_reload(3).await.unwrap();

    let fresh = mirror.topic(3).expect("re-added");
    assert!(!fresh.root().is_exist("stale.txt"), "directory starts clean");
    assert!(
        mirror.inner.topic_root.is_exist("recycles/3/stale.txt"),
        "old content is parked in the recycle bin"
    );
}

// --- refresh ---

#[tokio::test]
async fn test_refresh_requires_known_topic() {
    let (mirror, _temp) = create_test_mirror(Arc::new(FailingDownloader), 99).await;
    assert!(matches!(mirror.refresh(1), Err(Error::TopicNotFound(1))));
    mirror.add_topic(1).await.unwrap();
    mirror.refresh(1).unwrap();
}
