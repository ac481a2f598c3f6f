//! Backup listing and rollback on top of [`ConfigStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::ReconcileResult;
use crate::store::{BackupEntry, ConfigStore, RestoreReceipt, MAX_BACKUP_LISTING};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListing {
    #[serde(flatten)]
    pub entry: BackupEntry,
    /// Display age such as "5m ago".
    pub age: String,
}

pub struct BackupManager {
    store: Arc<ConfigStore>,
    default_limit: usize,
}

impl BackupManager {
    pub fn new(store: Arc<ConfigStore>, default_limit: usize) -> Self {
        Self {
            store,
            default_limit: default_limit.clamp(1, MAX_BACKUP_LISTING),
        }
    }

    /// Newest first. `None` uses the configured listing size.
    pub fn list(&self, limit: Option<usize>) -> ReconcileResult<Vec<BackupListing>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_backups(limit.unwrap_or(self.default_limit))?
            .into_iter()
            .map(|entry| BackupListing {
                age: humanize_age(entry.created_at, now),
                entry,
            })
            .collect())
    }

    /// Restore a named backup. The current state is backed up first, so a
    /// rollback can itself be rolled back.
    pub fn rollback(&self, name: &str) -> ReconcileResult<RestoreReceipt> {
        let receipt = self.store.restore(name)?;
        info!(
            target: "clawdeck::backup",
            restored = %receipt.restored,
            pre_restore = receipt.pre_restore_backup.as_ref().map(|b| b.name.as_str()).unwrap_or("-"),
            "rollback complete"
        );
        Ok(receipt)
    }
}

/// "just now" under a minute, then minutes, hours and days.
pub fn humanize_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - created).num_seconds().max(0);
    match seconds {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", seconds / 60),
        3600..=86_399 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86_400),
    }
}
