//! The recycle-bin reaper.

use super::Mirror;
use crate::sandbox::RootDir;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Recycle-bin directory under the topic root
pub(crate) const DIR_RECYCLE_BIN: &str = "recycles";
/// Deletion timestamp file inside each recycled directory
pub(crate) const DELETE_FLAG: &str = "deleted_at";

/// Sweep cadence
const SWEEP_CRON: &str = "@every 12h";

impl Mirror {
    /// Register the periodic recycle-bin sweep.
    pub(crate) fn register_recycle_sweep(&self) {
        let topic_root = self.inner.topic_root.clone();
        let retention_hours = self.inner.config.schedule.recycle_retention_hours;
        let result = self.inner.scheduler.add(
            SWEEP_CRON,
            Arc::new(move || {
                sweep_recycle_bin(&topic_root, retention_hours);
            }),
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "registering recycle sweep failed");
        }
    }
}

/// Remove recycled topic directories older than the retention window.
///
/// Entries with a missing or malformed `deleted_at` are logged and left
/// alone; better an immortal leftover than deleting something whose age is
/// unknown.
pub(crate) fn sweep_recycle_bin(topic_root: &RootDir, retention_hours: u64) {
    tracing::info!("sweeping recycle bin");
    let recycles = match topic_root.open_sub(DIR_RECYCLE_BIN) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "cannot open recycle bin");
            return;
        }
    };
    let entries = match recycles.read_dir() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read recycle bin");
            return;
        }
    };

    for entry in entries {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let flag = format!("{name}/{DELETE_FLAG}");

        let deleted_at = recycles
            .read_all(&flag)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc));
        let Some(deleted_at) = deleted_at else {
            tracing::warn!(entry = %name, "missing or malformed {DELETE_FLAG}, leaving alone");
            continue;
        };

        let age = Utc::now() - deleted_at;
        if age.num_hours() > retention_hours as i64 {
            tracing::info!(entry = %name, "purging recycled topic");
            if let Err(e) = recycles.remove_all(&name) {
                tracing::warn!(entry = %name, error = %e, "purging recycled topic failed");
            }
        }
    }
}
