//! Activation Engine
//!
//! The active model set lives in `agents.defaults.models` as an object keyed by
//! canonical model key. Every change goes through [`ConfigStore::mutate`] and is
//! then checked against the persisted snapshot: a committed write whose
//! read-back disagrees is a [`ReconcileError::ReadBackMismatch`], reported
//! separately from a write that failed outright.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{ErrorKind, ReconcileError, ReconcileResult};
use crate::layout;
use crate::merger::CatalogReport;
use crate::model::Availability;
use crate::normalize::{normalize_key, ModelKey};
use crate::store::{BackupEntry, ConfigStore};

const ACTIVE_MODELS_POINTER: &str = "/agents/defaults/models";

/// Whether a key is expected in the active set after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

/// Outcome of a single-key activation change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationChange {
    pub key: ModelKey,
    /// False when the key was already in the requested state.
    pub changed: bool,
    pub backup: Option<BackupEntry>,
    pub dry_run: bool,
}

/// Per-key result of a batch call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyOutcome {
    /// The input as given.
    pub raw: String,
    /// Canonical form, when the input normalized.
    pub key: Option<ModelKey>,
    pub ok: bool,
    pub changed: bool,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
}

impl KeyOutcome {
    fn from_result(raw: &str, result: ReconcileResult<ActivationChange>) -> Self {
        match result {
            Ok(change) => Self {
                raw: raw.to_string(),
                key: Some(change.key),
                ok: true,
                changed: change.changed,
                error_kind: None,
                reason: None,
            },
            Err(e) => Self {
                raw: raw.to_string(),
                key: normalize_key(raw).ok(),
                ok: false,
                changed: false,
                error_kind: Some(e.kind()),
                reason: Some(e.to_string()),
            },
        }
    }
}

/// An active key annotated with what the catalog currently says about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveModel {
    pub key: ModelKey,
    pub availability: Availability,
}

pub struct ActivationEngine {
    store: Arc<ConfigStore>,
}

impl ActivationEngine {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Canonical keys in `agents.defaults.models`, sorted.
    ///
    /// Stored keys are normalized on the way out; a corrupted key still counts
    /// as the model it names.
    pub fn list_active(&self) -> ReconcileResult<BTreeSet<ModelKey>> {
        let snapshot = self.store.read()?;
        Ok(active_keys(snapshot.root()))
    }

    pub fn activate(&self, raw: &str) -> ReconcileResult<ActivationChange> {
        self.apply(raw, Presence::Present)
    }

    pub fn deactivate(&self, raw: &str) -> ReconcileResult<ActivationChange> {
        self.apply(raw, Presence::Absent)
    }

    /// Each key is attempted on its own; a failure does not stop the rest.
    pub fn activate_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<KeyOutcome> {
        keys.iter()
            .map(|raw| KeyOutcome::from_result(raw.as_ref(), self.activate(raw.as_ref())))
            .collect()
    }

    pub fn deactivate_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<KeyOutcome> {
        keys.iter()
            .map(|raw| KeyOutcome::from_result(raw.as_ref(), self.deactivate(raw.as_ref())))
            .collect()
    }

    fn apply(&self, raw: &str, wanted: Presence) -> ReconcileResult<ActivationChange> {
        let key = normalize_key(raw)?;
        let reason = match wanted {
            Presence::Present => format!("activate {key}"),
            Presence::Absent => format!("deactivate {key}"),
        };

        let receipt = self.store.mutate(&reason, |root| {
            match wanted {
                Presence::Present => {
                    let models = layout::object_at_mut(root, layout::ACTIVE_MODELS)?;
                    if !models.contains_key(key.as_str()) {
                        // A quote-polluted twin carries the entry's settings over.
                        let carried = take_aliases(models, &key);
                        models.insert(key.to_string(), carried);
                    }
                }
                Presence::Absent => {
                    if let Some(models) = root
                        .pointer_mut(ACTIVE_MODELS_POINTER)
                        .and_then(Value::as_object_mut)
                    {
                        models.remove(key.as_str());
                        take_aliases(models, &key);
                    }
                }
            }
            Ok(())
        })?;

        verify_read_back(&key, wanted, receipt.snapshot.root())?;

        if receipt.changed {
            info!(
                target: "clawdeck::activation",
                key = %key,
                active = (wanted == Presence::Present),
                dry_run = receipt.dry_run,
                "activation state changed"
            );
        }
        Ok(ActivationChange {
            key,
            changed: receipt.changed,
            backup: receipt.backup,
            dry_run: receipt.dry_run,
        })
    }
}

/// Remove every non-canonical spelling of `key`, returning the first one's
/// settings (or an empty object).
fn take_aliases(models: &mut Map<String, Value>, key: &ModelKey) -> Value {
    let aliases: Vec<String> = models
        .keys()
        .filter(|stored| stored.as_str() != key.as_str())
        .filter(|stored| normalize_key(stored).map(|k| &k == key).unwrap_or(false))
        .cloned()
        .collect();
    let mut carried = None;
    for alias in aliases {
        if let Some(value) = models.remove(&alias) {
            carried.get_or_insert(value);
        }
    }
    carried.unwrap_or_else(|| Value::Object(Map::new()))
}

/// Normalized keys of the active set in `root`.
pub fn active_keys(root: &Value) -> BTreeSet<ModelKey> {
    layout::object_at(root, layout::ACTIVE_MODELS)
        .map(|models| {
            models
                .keys()
                .filter_map(|stored| match normalize_key(stored) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(target: "clawdeck::activation", stored = %stored, error = %e, "ignoring unusable active key");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Confirm the persisted tree holds `key` verbatim (or no spelling of it).
pub fn verify_read_back(key: &ModelKey, wanted: Presence, root: &Value) -> ReconcileResult<()> {
    let models = layout::object_at(root, layout::ACTIVE_MODELS);
    match wanted {
        Presence::Present => {
            let Some(models) = models else {
                return Err(ReconcileError::read_back(
                    key.as_str(),
                    "active model set missing after write",
                ));
            };
            if !models.contains_key(key.as_str()) {
                return Err(ReconcileError::read_back(
                    key.as_str(),
                    "canonical key not present after write",
                ));
            }
            if let Some(stray) = models
                .keys()
                .find(|stored| stored.as_str() != key.as_str() && normalize_key(stored).ok().as_ref() == Some(key))
            {
                return Err(ReconcileError::read_back(
                    key.as_str(),
                    format!("non-canonical spelling `{stray}` still stored"),
                ));
            }
            Ok(())
        }
        Presence::Absent => {
            let lingering = models.and_then(|m| {
                m.keys()
                    .find(|stored| normalize_key(stored).ok().as_ref() == Some(key))
            });
            match lingering {
                Some(stored) => Err(ReconcileError::read_back(
                    key.as_str(),
                    format!("`{stored}` still active after write"),
                )),
                None => Ok(()),
            }
        }
    }
}

/// Mark each active key with its catalog availability. Keys whose provider
/// has a live catalog that does not list them are unavailable; anything
/// without a live answer is unknown.
pub fn annotate(active: &BTreeSet<ModelKey>, reports: &[CatalogReport]) -> Vec<ActiveModel> {
    active
        .iter()
        .map(|key| {
            let report = reports.iter().find(|r| key.belongs_to(&r.provider));
            let availability = match report {
                Some(report) if report.contains(key) => report
                    .models
                    .iter()
                    .find(|m| &m.key == key)
                    .map(|m| m.availability)
                    .unwrap_or(Availability::Unknown),
                Some(report) if !report.is_stale() => Availability::Unavailable,
                _ => Availability::Unknown,
            };
            ActiveModel {
                key: key.clone(),
                availability,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::Freshness;
    use crate::model::ModelRecord;
    use crate::store::StoreConfig;
    use serde_json::json;

    fn engine(dir: &std::path::Path) -> ActivationEngine {
        ActivationEngine::new(Arc::new(ConfigStore::new(StoreConfig {
            config_path: dir.join("openclaw.json"),
            backup_dir: dir.join("backups"),
            dry_run: false,
        })))
    }

    fn key(raw: &str) -> ModelKey {
        normalize_key(raw).unwrap()
    }

    #[test]
    fn test_activate_quote_corrupted_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let change = engine.activate("'providerB/modelY'").unwrap();
        assert_eq!(change.key.as_str(), "providerb/modelY");
        assert!(change.changed);

        let raw = std::fs::read_to_string(dir.path().join("openclaw.json")).unwrap();
        assert!(raw.contains("\"providerb/modelY\""));
        assert!(!raw.contains('\''));
    }

    #[test]
    fn test_idempotent_toggles_do_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        engine.activate("openai/gpt-4o").unwrap();
        let again = engine.activate("OpenAI/gpt-4o").unwrap();
        assert!(!again.changed);
        assert!(again.backup.is_none());

        let absent = engine.deactivate("groq/llama").unwrap();
        assert!(!absent.changed);
    }

    #[test]
    fn test_activation_replaces_polluted_twin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openclaw.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "agents": { "defaults": { "models": { "\"groq/llama\"": { "alias": "fast" } } } }
            }))
            .unwrap(),
        )
        .unwrap();
        let engine = engine(dir.path());

        // Reads already see the canonical key.
        assert!(engine.list_active().unwrap().contains(&key("groq/llama")));

        let change = engine.activate("groq/llama").unwrap();
        assert!(change.changed);
        let stored: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            stored["agents"]["defaults"]["models"],
            json!({ "groq/llama": { "alias": "fast" } })
        );
    }

    #[test]
    fn test_deactivate_clears_every_spelling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("openclaw.json"),
            r#"{"agents":{"defaults":{"models":{"'groq/llama'":{},"openai/gpt-4o":{}}}}}"#,
        )
        .unwrap();
        let engine = engine(dir.path());

        let change = engine.deactivate("GROQ/llama").unwrap();
        assert!(change.changed);
        assert!(change.backup.is_some());
        let active: Vec<String> = engine.list_active().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(active, vec!["openai/gpt-4o"]);
    }

    #[test]
    fn test_batch_reports_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let outcomes = engine.activate_many(&["openai/gpt-4o", "  ", "groq/llama"]);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(outcomes[1].error_kind, Some(ErrorKind::Validation));
        assert!(outcomes[2].ok);

        let active: Vec<String> = engine
            .list_active()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(active, vec!["groq/llama", "openai/gpt-4o"]);
    }

    #[test]
    fn test_verify_read_back_detects_divergence() {
        let k = key("openai/gpt-4o");
        let stored = json!({ "agents": { "defaults": { "models": { "'openai/gpt-4o'": {} } } } });
        let err = verify_read_back(&k, Presence::Present, &stored).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReadBackMismatch);

        let err = verify_read_back(&k, Presence::Absent, &stored).unwrap_err();
        assert!(err.to_string().contains("still active"));

        let clean = json!({ "agents": { "defaults": { "models": { "openai/gpt-4o": {} } } } });
        assert!(verify_read_back(&k, Presence::Present, &clean).is_ok());
        assert!(verify_read_back(&k, Presence::Absent, &json!({})).is_ok());
    }

    #[test]
    fn test_annotate_against_catalogs() {
        let active: BTreeSet<ModelKey> =
            ["openai/gpt-4o", "openai/gone", "groq/llama"].iter().map(|k| key(k)).collect();
        let reports = vec![CatalogReport {
            provider: "openai".to_string(),
            models: vec![ModelRecord {
                key: key("openai/gpt-4o"),
                name: "GPT-4o".to_string(),
                availability: Availability::Available,
            }],
            freshness: Freshness::Live,
            source: Some("runtime".to_string()),
            skipped: Vec::new(),
        }];
        let annotated = annotate(&active, &reports);
        let by_key = |k: &str| annotated.iter().find(|a| a.key.as_str() == k).unwrap().availability;
        assert_eq!(by_key("openai/gpt-4o"), Availability::Available);
        assert_eq!(by_key("openai/gone"), Availability::Unavailable);
        assert_eq!(by_key("groq/llama"), Availability::Unknown);
    }
}
