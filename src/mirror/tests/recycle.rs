use crate::mirror::recycle::sweep_recycle_bin;
use crate::sandbox::RootDir;
use chrono::{Duration, Utc};

fn recycle_entry(root: &RootDir, name: &str, deleted_at: Option<String>) {
    let dir = format!("recycles/{name}");
    root.open_sub(&dir).unwrap();
    root.write_all(format!("{dir}/post.md"), b"# recycled").unwrap();
    if let Some(stamp) = deleted_at {
        root.write_all(format!("{dir}/deleted_at"), stamp.as_bytes())
            .unwrap();
    }
}

#[test]
fn test_sweep_purges_only_expired_entries() {
    let temp = tempfile::tempdir().unwrap();
    let root = RootDir::open(temp.path()).unwrap();

    let old = (Utc::now() - Duration::hours(169)).to_rfc3339();
    let fresh = (Utc::now() - Duration::hours(1)).to_rfc3339();
    recycle_entry(&root, "100", Some(old));
    recycle_entry(&root, "200", Some(fresh));

    sweep_recycle_bin(&root, 168);

    assert!(!root.is_exist("recycles/100"), "expired entry is purged");
    assert!(root.is_exist("recycles/200"), "fresh entry survives");
}

#[test]
fn test_sweep_leaves_malformed_entries_alone() {
    let temp = tempfile::tempdir().unwrap();
    let root = RootDir::open(temp.path()).unwrap();

    recycle_entry(&root, "300", None);
    recycle_entry(&root, "400", Some("not a timestamp".to_string()));

    sweep_recycle_bin(&root, 168);

    assert!(root.is_exist("recycles/300"), "missing stamp is left alone");
    assert!(root.is_exist("recycles/400"), "malformed stamp is left alone");
}

#[test]
fn test_sweep_without_recycle_bin_is_harmless() {
    let temp = tempfile::tempdir().unwrap();
    let root = RootDir::open(temp.path()).unwrap();
    sweep_recycle_bin(&root, 168);
}
