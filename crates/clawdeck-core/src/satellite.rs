//! Satellite files and the atomic write discipline shared with the primary store.
//!
//! Every file is replaced by writing a sibling temp file, syncing it, reading it
//! back and renaming it over the target. Readers therefore only ever observe a
//! complete file. Temp files are named `.{target}.{uuid}.tmp` so an interrupted
//! write can be recognised and swept by the self-heal pass.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{ReconcileError, ReconcileResult};

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

const TEMP_SUFFIX: &str = ".tmp";

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sibling temp path for `target`.
pub(crate) fn temp_path_for(target: &Path) -> PathBuf {
    let name = format!(".{}.{}{}", file_name(target), uuid::Uuid::new_v4(), TEMP_SUFFIX);
    target.with_file_name(name)
}

/// Whether `candidate` is a leftover temp file for `target`.
pub(crate) fn is_temp_for(target: &Path, candidate: &str) -> bool {
    let prefix = format!(".{}.", file_name(target));
    candidate.starts_with(&prefix) && candidate.ends_with(TEMP_SUFFIX)
}

pub(crate) fn ensure_parent(path: &Path) -> ReconcileResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(ReconcileError::io(parent))?;
    }
    Ok(())
}

/// Write `bytes` to a fresh temp file next to `target`, fsync it and verify
/// that reading it back yields the same bytes. Returns the temp path.
pub(crate) fn write_temp(target: &Path, bytes: &[u8]) -> ReconcileResult<PathBuf> {
    ensure_parent(target)?;
    let temp = temp_path_for(target);
    let result = (|| -> ReconcileResult<()> {
        let mut file = fs::File::create(&temp).map_err(ReconcileError::io(&temp))?;
        file.write_all(bytes).map_err(ReconcileError::io(&temp))?;
        file.sync_all().map_err(ReconcileError::io(&temp))?;
        let written = fs::read(&temp).map_err(ReconcileError::io(&temp))?;
        if written != bytes {
            return Err(ReconcileError::read_back(
                temp.display().to_string(),
                "temp file content differs from what was written",
            ));
        }
        Ok(())
    })();
    match result {
        Ok(()) => Ok(temp),
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Rename a verified temp file over `target`, removing the temp file on failure.
pub(crate) fn promote(temp: &Path, target: &Path) -> ReconcileResult<()> {
    if let Err(e) = fs::rename(temp, target) {
        let _ = fs::remove_file(temp);
        return Err(ReconcileError::io(target)(e));
    }
    debug!(target: "clawdeck::fs", path = %target.display(), "atomic replace complete");
    Ok(())
}

/// Temp-write then rename.
pub(crate) fn atomic_write(target: &Path, bytes: &[u8]) -> ReconcileResult<()> {
    let temp = write_temp(target, bytes)?;
    promote(&temp, target)
}

/// Pretty JSON with a trailing newline, the layout the runtime itself writes.
pub(crate) fn render_json(path: &Path, value: &Value) -> ReconcileResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(ReconcileError::json(path))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> ReconcileResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ReconcileError::io(path)(e)),
    }
}

/// Remove leftover temp files belonging to `target`.
pub(crate) fn sweep_temp_files(target: &Path) -> Vec<PathBuf> {
    let dir = match target.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("."),
    };
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_temp_for(target, &name) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(
                target: "clawdeck::fs",
                path = %path.display(),
                error = %e,
                "failed to remove stale temp file"
            ),
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// JsonFile
// ---------------------------------------------------------------------------

/// A JSON satellite file with its own write lock.
#[derive(Debug)]
pub struct JsonFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file. Missing file is `Ok(None)`.
    pub fn load(&self) -> ReconcileResult<Option<Value>> {
        match read_optional(&self.path)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(ReconcileError::json(&self.path)),
        }
    }

    /// Read-modify-write under the file's lock. The file is only rewritten
    /// when the transform changed something. Returns the transform's output.
    pub fn update<T>(
        &self,
        default: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> ReconcileResult<T>,
    ) -> ReconcileResult<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ReconcileError::ConcurrencyViolation(format!("{} lock poisoned", self.path.display())))?;

        let current = self.load()?;
        let existed = current.is_some();
        let current = current.unwrap_or_else(default);
        let mut next = current.clone();
        let output = f(&mut next)?;
        if existed && next == current {
            return Ok(output);
        }
        let bytes = render_json(&self.path, &next)?;
        atomic_write(&self.path, &bytes)?;
        Ok(output)
    }

    /// Overwrite unconditionally under the lock.
    pub fn replace(&self, value: &Value) -> ReconcileResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ReconcileError::ConcurrencyViolation(format!("{} lock poisoned", self.path.display())))?;
        let bytes = render_json(&self.path, value)?;
        atomic_write(&self.path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Secondary auth-profile store
// ---------------------------------------------------------------------------

/// The runtime's own credential store (`auth-profiles.json`): `{ "profiles": { id: {...} } }`.
#[derive(Debug)]
pub struct AuthProfileStore {
    file: JsonFile,
}

fn empty_profile_store() -> Value {
    json!({ "version": 1, "profiles": {} })
}

impl AuthProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Profiles keyed by id. A missing file is an empty store.
    pub fn profiles(&self) -> ReconcileResult<Map<String, Value>> {
        Ok(self
            .file
            .load()?
            .and_then(|root| root.get("profiles").and_then(Value::as_object).cloned())
            .unwrap_or_default())
    }

    /// Remove every profile matching `predicate`. Returns the removed ids.
    pub fn remove_where(
        &self,
        predicate: impl Fn(&str, &Value) -> bool,
    ) -> ReconcileResult<Vec<String>> {
        if self.file.load()?.is_none() {
            return Ok(Vec::new());
        }
        self.file.update(empty_profile_store, |root| {
            let Some(profiles) = root.get_mut("profiles").and_then(Value::as_object_mut) else {
                return Ok(Vec::new());
            };
            let doomed: Vec<String> = profiles
                .iter()
                .filter(|(id, profile)| predicate(id, profile))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &doomed {
                profiles.remove(id);
            }
            Ok(doomed)
        })
    }
}

// ---------------------------------------------------------------------------
// Cached catalog (`models.json`)
// ---------------------------------------------------------------------------

/// Read-only view of the runtime's cached model catalog.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    path: PathBuf,
}

impl CatalogCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw model entries cached for `provider`. Missing file or provider is empty.
    pub fn provider_models(&self, provider: &str) -> ReconcileResult<Vec<Value>> {
        let Some(bytes) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let root: Value = serde_json::from_slice(&bytes).map_err(ReconcileError::json(&self.path))?;
        let providers = root.get("providers").and_then(Value::as_object);
        let entry = providers.and_then(|p| {
            p.get(provider).or_else(|| {
                p.iter()
                    .find(|(id, _)| id.eq_ignore_ascii_case(provider))
                    .map(|(_, v)| v)
            })
        });
        Ok(entry
            .and_then(|e| e.get("models"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}
