//! Config Store
//!
//! The single write path for the runtime's primary configuration file.
//!
//! ## Mutation
//!
//! [`ConfigStore::mutate`] runs one read-modify-write cycle under a process-wide
//! lock:
//!
//! 1. Read the current bytes.
//! 2. Apply the transform to an in-memory copy. An unchanged tree ends here.
//! 3. Validate what the transform changed against [`crate::schema`].
//! 4. Copy the bytes read in step 1 into the backup directory.
//! 5. Write a sibling temp file, fsync it and read it back.
//! 6. Confirm nobody replaced the primary file since step 1.
//! 7. Rename the temp file over the primary and re-read it.
//!
//! A failure at any step leaves the primary file untouched.
//!
//! ## Backups
//!
//! Backups are named `backup-YYYYMMDD-HHMMSS-mmm.json` (UTC) and retained
//! indefinitely. Creation times are strictly increasing within a process, so a
//! listing sorted by time is also sorted by creation order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::satellite::{self, promote, read_optional, render_json, write_temp};
use crate::schema;

const BACKUP_PREFIX: &str = "backup-";
const BACKUP_STAMP: &str = "%Y%m%d-%H%M%S-%3f";
/// Hard ceiling on a single listing.
pub const MAX_BACKUP_LISTING: usize = 200;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The whole persisted tree at one point in time.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    root: Value,
    exists: bool,
}

impl ConfigSnapshot {
    fn empty() -> Self {
        Self {
            root: Value::Object(Map::new()),
            exists: false,
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Whether the primary file existed when this snapshot was taken.
    pub fn exists(&self) -> bool {
        self.exists
    }
}

/// One copy of the primary file in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Result of a committed (or dry-run) mutation.
#[derive(Debug, Clone)]
pub struct MutationReceipt {
    /// Backup of the pre-mutation state, when a write happened.
    pub backup: Option<BackupEntry>,
    /// State after the mutation: re-read from disk, or the computed tree in dry-run.
    pub snapshot: ConfigSnapshot,
    pub changed: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReceipt {
    pub restored: String,
    /// Backup of the state that was overwritten; `None` in dry-run.
    pub pre_restore_backup: Option<BackupEntry>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub config_path: PathBuf,
    pub backup_dir: PathBuf,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Handle on the primary configuration file. Share it behind an `Arc`.
pub struct ConfigStore {
    config: StoreConfig,
    /// Guards the write path; holds the epoch millis of the last backup taken.
    write_lock: Mutex<i64>,
}

impl ConfigStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(0),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config.config_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    fn lock(&self) -> ReconcileResult<MutexGuard<'_, i64>> {
        self.write_lock.lock().map_err(|_| {
            ReconcileError::ConcurrencyViolation(
                "configuration write lock poisoned by a panicked writer".to_string(),
            )
        })
    }

    fn parse(&self, bytes: &[u8]) -> ReconcileResult<Value> {
        let root: Value =
            serde_json::from_slice(bytes).map_err(ReconcileError::json(&self.config.config_path))?;
        if !root.is_object() {
            return Err(ReconcileError::validation(
                "$",
                "configuration root must be an object",
            ));
        }
        Ok(root)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read the current snapshot. Lock-free; the rename discipline guarantees
    /// a complete file. Invariant violations are logged, not fatal.
    pub fn read(&self) -> ReconcileResult<ConfigSnapshot> {
        let Some(bytes) = read_optional(&self.config.config_path)? else {
            return Ok(ConfigSnapshot::empty());
        };
        let root = self.parse(&bytes)?;
        for corruption in schema::scan_corruption(&root) {
            warn!(target: "clawdeck::store", error = %corruption, "stored configuration violates key invariants");
        }
        Ok(ConfigSnapshot { root, exists: true })
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Apply `transform` atomically. `reason` is recorded in the log.
    pub fn mutate<F>(&self, reason: &str, transform: F) -> ReconcileResult<MutationReceipt>
    where
        F: FnOnce(&mut Value) -> ReconcileResult<()>,
    {
        let mut last_backup = self.lock()?;
        let path = &self.config.config_path;

        let before = read_optional(path)?;
        let current = match &before {
            Some(bytes) => self.parse(bytes)?,
            None => Value::Object(Map::new()),
        };

        let mut next = current.clone();
        transform(&mut next)?;

        if next == current {
            debug!(target: "clawdeck::store", reason, "mutation is a no-op; nothing written");
            return Ok(MutationReceipt {
                backup: None,
                snapshot: ConfigSnapshot {
                    root: current,
                    exists: before.is_some(),
                },
                changed: false,
                dry_run: self.config.dry_run,
            });
        }

        schema::validate_changes(&current, &next)?;
        let bytes = render_json(path, &next)?;

        if self.config.dry_run {
            info!(target: "clawdeck::store", reason, "dry-run: mutation validated, not written");
            return Ok(MutationReceipt {
                backup: None,
                snapshot: ConfigSnapshot {
                    root: next,
                    exists: true,
                },
                changed: true,
                dry_run: true,
            });
        }

        let backup = match &before {
            Some(previous) => Some(self.write_backup(&mut last_backup, previous)?),
            None => None,
        };

        let temp = write_temp(path, &bytes)?;
        let on_disk = match read_optional(path) {
            Ok(on_disk) => on_disk,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e);
            }
        };
        if on_disk != before {
            let _ = fs::remove_file(&temp);
            return Err(ReconcileError::ConcurrencyViolation(format!(
                "{} changed on disk while `{reason}` was in flight",
                path.display()
            )));
        }
        promote(&temp, path)?;

        let snapshot = self.read()?;
        info!(
            target: "clawdeck::store",
            reason,
            backup = backup.as_ref().map(|b| b.name.as_str()).unwrap_or("-"),
            "configuration committed"
        );
        Ok(MutationReceipt {
            backup,
            snapshot,
            changed: true,
            dry_run: false,
        })
    }

    // -----------------------------------------------------------------------
    // Backup / restore
    // -----------------------------------------------------------------------

    /// Copy the current primary file into the backup directory. A dry-run
    /// store writes no backups and refuses.
    pub fn backup(&self) -> ReconcileResult<BackupEntry> {
        if self.config.dry_run {
            return Err(ReconcileError::validation(
                "dryRun",
                "backups are not written in dry-run mode",
            ));
        }
        let mut last_backup = self.lock()?;
        let path = &self.config.config_path;
        let bytes = read_optional(path)?.ok_or_else(|| ReconcileError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "nothing to back up"),
        })?;
        self.write_backup(&mut last_backup, &bytes)
    }

    fn write_backup(&self, last_backup_ms: &mut i64, bytes: &[u8]) -> ReconcileResult<BackupEntry> {
        let mut stamp_ms = Utc::now().timestamp_millis().max(*last_backup_ms + 1);
        let (name, target) = loop {
            let created = millis_to_utc(stamp_ms);
            let name = format!("{BACKUP_PREFIX}{}.json", created.format(BACKUP_STAMP));
            let target = self.config.backup_dir.join(&name);
            if !target.exists() {
                break (name, target);
            }
            stamp_ms += 1;
        };

        satellite::atomic_write(&target, bytes)?;
        *last_backup_ms = stamp_ms;

        debug!(target: "clawdeck::store", backup = %name, size = bytes.len(), "backup written");
        Ok(BackupEntry {
            name,
            created_at: millis_to_utc(stamp_ms),
            size_bytes: bytes.len() as u64,
        })
    }

    /// Overwrite the primary file with a backup's exact bytes, after backing
    /// up the current state.
    pub fn restore(&self, name: &str) -> ReconcileResult<RestoreReceipt> {
        let source = self.resolve_backup(name)?;
        let bytes = fs::read(&source).map_err(ReconcileError::io(&source))?;
        // Refuse to install something the runtime cannot parse.
        self.parse(&bytes)?;

        if self.config.dry_run {
            info!(target: "clawdeck::store", backup = %name, "dry-run: restore validated, not written");
            return Ok(RestoreReceipt {
                restored: name.to_string(),
                pre_restore_backup: None,
            });
        }

        let mut last_backup = self.lock()?;
        let path = &self.config.config_path;
        let pre_restore_backup = match read_optional(path)? {
            Some(current) => Some(self.write_backup(&mut last_backup, &current)?),
            None => None,
        };

        let temp = write_temp(path, &bytes)?;
        promote(&temp, path)?;
        let reread = fs::read(path).map_err(ReconcileError::io(path))?;
        if reread != bytes {
            return Err(ReconcileError::read_back(
                name,
                "primary file differs from the backup after restore",
            ));
        }

        info!(
            target: "clawdeck::store",
            restored = %name,
            pre_restore = pre_restore_backup.as_ref().map(|b| b.name.as_str()).unwrap_or("-"),
            "configuration restored from backup"
        );
        Ok(RestoreReceipt {
            restored: name.to_string(),
            pre_restore_backup,
        })
    }

    fn resolve_backup(&self, name: &str) -> ReconcileResult<PathBuf> {
        let trimmed = name.trim();
        let is_bare = !trimmed.is_empty()
            && trimmed != "."
            && trimmed != ".."
            && !trimmed.contains(['/', '\\']);
        if !is_bare {
            return Err(ReconcileError::validation(
                "name",
                format!("`{name}` is not a backup file name"),
            ));
        }
        let path = self.config.backup_dir.join(trimmed);
        if !path.is_file() {
            return Err(ReconcileError::BackupNotFound(trimmed.to_string()));
        }
        Ok(path)
    }

    /// Backups in the backup directory, newest first, at most `limit`.
    pub fn list_backups(&self, limit: usize) -> ReconcileResult<Vec<BackupEntry>> {
        let dir = &self.config.backup_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ReconcileError::io(dir)(e)),
        };

        let mut backups: Vec<BackupEntry> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_backup_name(&name) {
                    return None;
                }
                let meta = entry.metadata().ok().filter(|m| m.is_file())?;
                let created_at = parse_backup_stamp(&name).or_else(|| {
                    meta.modified().ok().map(DateTime::<Utc>::from)
                })?;
                Some(BackupEntry {
                    name,
                    created_at,
                    size_bytes: meta.len(),
                })
            })
            .collect();

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        backups.truncate(limit.clamp(1, MAX_BACKUP_LISTING));
        Ok(backups)
    }
}

// ---------------------------------------------------------------------------
// Backup names
// ---------------------------------------------------------------------------

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Names this crate writes, plus the names older tooling left behind.
fn is_backup_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    (name.starts_with(BACKUP_PREFIX) && name.ends_with(".json"))
        || name.starts_with("openclaw_bkp_")
        || name.ends_with(".json.bak")
}

/// Creation time encoded in a backup name, if it carries one.
fn parse_backup_stamp(name: &str) -> Option<DateTime<Utc>> {
    if let Some(stamp) = name
        .strip_prefix(BACKUP_PREFIX)
        .and_then(|rest| rest.strip_suffix(".json"))
    {
        for format in [BACKUP_STAMP, "%Y%m%d-%H%M%S", "%Y%m%d-%H%M"] {
            if let Ok(naive) = parse_naive(stamp, format) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        return None;
    }
    // easyclaw_YYYYmmdd_HHMMSS.json.bak
    let stamp = name.strip_suffix(".json.bak")?.rsplit_once('_').and_then(|(head, time)| {
        head.rsplit_once('_').map(|(_, date)| format!("{date}_{time}"))
    })?;
    parse_naive(&stamp, "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_naive(stamp: &str, format: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    // Minute-resolution names need the seconds supplied for NaiveDateTime.
    if format == "%Y%m%d-%H%M" {
        return NaiveDateTime::parse_from_str(&format!("{stamp}00"), "%Y%m%d-%H%M%S");
    }
    NaiveDateTime::parse_from_str(stamp, format)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
