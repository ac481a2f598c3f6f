//! Startup self-heal.
//!
//! Older tooling left quote-polluted model keys, string-form policies and
//! mixed-case provider names in the primary file. [`heal_tree`] rewrites all of
//! them in memory; [`SelfHeal::run`] commits the result in one mutation and
//! tidies the satellite files, resetting an unreadable search adapter file.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ReconcileResult;
use crate::layout;
use crate::normalize::{normalize_key, normalize_provider, ModelKey};
use crate::satellite::{sweep_temp_files, AuthProfileStore};
use crate::search::SearchSettings;
use crate::store::{BackupEntry, ConfigStore};

/// Token values left behind by aborted interactive prompts.
const PLACEHOLDER_TOKENS: [&str; 3] = ["Symbol(clack:", "undefined", "null"];

/// One key rewritten (or dropped, when `after` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRewrite {
    pub location: String,
    pub before: String,
    pub after: Option<String>,
}

/// In-memory changes made by [`heal_tree`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRepairs {
    pub rewrites: Vec<KeyRewrite>,
    /// Policy locations upgraded from the string form.
    pub upgraded_policies: Vec<String>,
}

impl TreeRepairs {
    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty() && self.upgraded_policies.is_empty()
    }

    fn record(&mut self, location: &str, before: &str, after: Option<&ModelKey>) {
        self.rewrites.push(KeyRewrite {
            location: location.to_string(),
            before: before.to_string(),
            after: after.map(ToString::to_string),
        });
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealReport {
    #[serde(flatten)]
    pub repairs: TreeRepairs,
    pub backup: Option<BackupEntry>,
    pub removed_temp_files: Vec<PathBuf>,
    pub purged_profiles: Vec<String>,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Tree repair
// ---------------------------------------------------------------------------

/// Rewrite every non-canonical key in place.
pub fn heal_tree(root: &mut Value) -> TreeRepairs {
    let mut repairs = TreeRepairs::default();
    heal_active_models(root, &mut repairs);
    heal_policies(root, &mut repairs);
    heal_profile_providers(root, &mut repairs);
    heal_provider_ids(root, &mut repairs);
    repairs
}

fn heal_active_models(root: &mut Value, repairs: &mut TreeRepairs) {
    let location = layout::dotted(layout::ACTIVE_MODELS);
    let Some(models) = root.pointer_mut("/agents/defaults/models").and_then(Value::as_object_mut) else {
        return;
    };
    if models.keys().all(|k| normalize_key(k).map(|c| c.as_str() == k).unwrap_or(false)) {
        return;
    }

    let mut healed = Map::new();
    for (stored, settings) in std::mem::take(models) {
        match normalize_key(&stored) {
            Ok(key) if key.as_str() == stored => {
                // The canonical spelling wins over any polluted twin seen earlier.
                healed.insert(stored, settings);
            }
            Ok(key) => {
                repairs.record(&location, &stored, Some(&key));
                healed.entry(key.to_string()).or_insert(settings);
            }
            Err(_) => repairs.record(&location, &stored, None),
        }
    }
    *models = healed;
}

fn heal_policy(location: &str, value: &mut Value, repairs: &mut TreeRepairs) {
    if let Value::String(primary) = value {
        let mut upgraded = Map::new();
        upgraded.insert("primary".to_string(), Value::String(primary.clone()));
        upgraded.insert("fallbacks".to_string(), Value::Array(Vec::new()));
        *value = Value::Object(upgraded);
        repairs.upgraded_policies.push(location.to_string());
    }
    let Some(policy) = value.as_object_mut() else {
        return;
    };

    let mut primary: Option<ModelKey> = None;
    if let Some(raw) = policy.get("primary").and_then(Value::as_str).map(str::to_string) {
        if !raw.trim().is_empty() {
            match normalize_key(&raw) {
                Ok(key) => {
                    if key.as_str() != raw {
                        repairs.record(location, &raw, Some(&key));
                        policy.insert("primary".to_string(), Value::String(key.to_string()));
                    }
                    primary = Some(key);
                }
                Err(_) => {
                    repairs.record(location, &raw, None);
                    policy.insert("primary".to_string(), Value::String(String::new()));
                }
            }
        }
    }

    let Some(fallbacks) = policy.get("fallbacks").and_then(Value::as_array).cloned() else {
        return;
    };
    let mut healed: Vec<Value> = Vec::new();
    let mut seen: Vec<ModelKey> = primary.into_iter().collect();
    for entry in &fallbacks {
        let Some(raw) = entry.as_str() else {
            continue;
        };
        match normalize_key(raw) {
            Ok(key) => {
                if key.as_str() != raw {
                    repairs.record(location, raw, Some(&key));
                }
                if !seen.contains(&key) {
                    healed.push(Value::String(key.to_string()));
                    seen.push(key);
                }
            }
            Err(_) => repairs.record(location, raw, None),
        }
    }
    if healed != fallbacks {
        policy.insert("fallbacks".to_string(), Value::Array(healed));
    }
}

fn heal_policies(root: &mut Value, repairs: &mut TreeRepairs) {
    if let Some(policy) = root.pointer_mut("/agents/defaults/model") {
        heal_policy("agents.defaults.model", policy, repairs);
    }
    if let Some(policy) = root.pointer_mut("/agents/defaults/subagents/model") {
        heal_policy("agents.defaults.subagents.model", policy, repairs);
    }
    let Some(list) = root.pointer_mut("/agents/list").and_then(Value::as_array_mut) else {
        return;
    };
    for agent in list.iter_mut() {
        let id = layout::agent_id(agent).unwrap_or("?").to_string();
        if let Some(policy) = agent.get_mut(layout::MODEL_FIELD) {
            heal_policy(&format!("agents.list[{id}].model"), policy, repairs);
        }
        if let Some(policy) = agent.pointer_mut("/subagents/model") {
            heal_policy(&format!("agents.list[{id}].subagents.model"), policy, repairs);
        }
    }
}

fn heal_profile_providers(root: &mut Value, repairs: &mut TreeRepairs) {
    let Some(profiles) = root.pointer_mut("/auth/profiles").and_then(Value::as_object_mut) else {
        return;
    };
    for (id, profile) in profiles.iter_mut() {
        // Profiles without a provider are named after their id prefix.
        let raw = profile
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let normalized = normalize_provider(&raw)
            .or_else(|| normalize_provider(id.split(':').next().unwrap_or("")));
        if let (Some(normalized), Some(map)) = (normalized, profile.as_object_mut()) {
            if normalized != raw {
                repairs.rewrites.push(KeyRewrite {
                    location: format!("auth.profiles.{id}.provider"),
                    before: raw,
                    after: Some(normalized.clone()),
                });
                map.insert("provider".to_string(), Value::String(normalized));
            }
        }
    }
}

fn heal_provider_ids(root: &mut Value, repairs: &mut TreeRepairs) {
    let Some(providers) = root.pointer_mut("/models/providers").and_then(Value::as_object_mut) else {
        return;
    };
    let renames: Vec<(String, String)> = providers
        .keys()
        .filter_map(|id| normalize_provider(id).filter(|n| n != id).map(|n| (id.clone(), n)))
        .collect();
    for (before, after) in renames {
        if providers.contains_key(&after) {
            // Keep the entry already stored under the normalized id.
            warn!(target: "clawdeck::heal", provider = %before, "dropping duplicate provider entry");
            providers.remove(&before);
        } else if let Some(entry) = providers.remove(&before) {
            providers.insert(after.clone(), entry);
        }
        repairs.rewrites.push(KeyRewrite {
            location: "models.providers".to_string(),
            before,
            after: Some(after),
        });
    }
}

/// Token profiles whose token is empty or a prompt placeholder.
pub fn is_placeholder_token_profile(profile: &Value) -> bool {
    if profile.get("type").and_then(Value::as_str) != Some("token") {
        return false;
    }
    let token = match profile.get("token") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    token.is_empty() || PLACEHOLDER_TOKENS.iter().any(|p| token.contains(p))
}

// ---------------------------------------------------------------------------
// SelfHeal
// ---------------------------------------------------------------------------

pub struct SelfHeal {
    store: Arc<ConfigStore>,
    auth_store: Arc<AuthProfileStore>,
    search: Arc<SearchSettings>,
    /// Other satellite files whose temp leftovers are swept.
    satellites: Vec<PathBuf>,
}

impl SelfHeal {
    pub fn new(
        store: Arc<ConfigStore>,
        auth_store: Arc<AuthProfileStore>,
        search: Arc<SearchSettings>,
        satellites: Vec<PathBuf>,
    ) -> Self {
        Self {
            store,
            auth_store,
            search,
            satellites,
        }
    }

    pub fn run(&self) -> ReconcileResult<HealReport> {
        let dry_run = self.store.is_dry_run();
        let mut report = HealReport {
            dry_run,
            ..HealReport::default()
        };

        if !dry_run {
            let mut targets = vec![self.store.config_path().to_path_buf(), self.auth_store.path().to_path_buf()];
            targets.extend(self.satellites.iter().cloned());
            for target in &targets {
                report.removed_temp_files.extend(sweep_temp_files(target));
            }
            // An existing adapter file that no longer parses is reset to defaults.
            if self.search.path().exists() {
                self.search.load()?;
            }
        }

        let mut repairs = TreeRepairs::default();
        let receipt = self.store.mutate("self-heal", |root| {
            repairs = heal_tree(root);
            Ok(())
        })?;
        for rewrite in &repairs.rewrites {
            info!(
                target: "clawdeck::heal",
                location = %rewrite.location,
                before = %rewrite.before,
                after = rewrite.after.as_deref().unwrap_or("<dropped>"),
                "rewrote non-canonical key"
            );
        }
        report.repairs = repairs;
        report.backup = receipt.backup;

        report.purged_profiles = if dry_run {
            self.auth_store
                .profiles()?
                .iter()
                .filter(|(_, profile)| is_placeholder_token_profile(profile))
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            self.auth_store.remove_where(|_, profile| is_placeholder_token_profile(profile))?
        };
        for id in &report.purged_profiles {
            warn!(target: "clawdeck::heal", profile = %id, dry_run, "purging placeholder token profile");
        }

        info!(
            target: "clawdeck::heal",
            rewrites = report.repairs.rewrites.len(),
            upgraded = report.repairs.upgraded_policies.len(),
            temp_files = report.removed_temp_files.len(),
            purged = report.purged_profiles.len(),
            "self-heal finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heal_active_models_merges_collisions() {
        let mut root = json!({ "agents": { "defaults": { "models": {
            "'groq/llama'": { "alias": "polluted" },
            "groq/llama": { "alias": "clean" },
            "\"OpenAI/gpt-4o\"": {},
            "''": {}
        } } } });
        let repairs = heal_tree(&mut root);
        assert_eq!(
            root["agents"]["defaults"]["models"],
            json!({ "groq/llama": { "alias": "clean" }, "openai/gpt-4o": {} })
        );
        assert_eq!(repairs.rewrites.len(), 3);
        assert!(repairs.rewrites.iter().any(|r| r.before == "''" && r.after.is_none()));
    }

    #[test]
    fn test_heal_upgrades_and_normalizes_policies() {
        let mut root = json!({ "agents": {
            "defaults": {
                "model": "'Anthropic/claude-3'",
                "subagents": { "model": { "primary": "groq/llama", "fallbacks": ["GROQ/llama", "'x/y'", "x/y"] } }
            },
            "list": [{ "id": "coder", "model": { "primary": "\"Mistral/large\"", "fallbacks": [] } }]
        } });
        let repairs = heal_tree(&mut root);

        assert_eq!(
            root["agents"]["defaults"]["model"],
            json!({ "primary": "anthropic/claude-3", "fallbacks": [] })
        );
        assert_eq!(root["agents"]["defaults"]["subagents"]["model"]["fallbacks"], json!(["x/y"]));
        assert_eq!(root["agents"]["list"][0]["model"]["primary"], json!("mistral/large"));
        assert_eq!(repairs.upgraded_policies, vec!["agents.defaults.model"]);
        assert!(crate::schema::validate(&root).is_ok());
    }

    #[test]
    fn test_heal_is_idempotent() {
        let mut root = json!({
            "agents": { "defaults": { "models": { "'a/b'": {} }, "model": "a/b" } },
            "auth": { "profiles": { "x:1": { "provider": " OpenAI " }, "Groq:default": { "mode": "api_key" } } },
            "models": { "providers": { "MyBox": { "baseUrl": "http://h/v1" } } }
        });
        assert!(!heal_tree(&mut root).is_empty());
        let once = root.clone();
        assert!(heal_tree(&mut root).is_empty());
        assert_eq!(root, once);
        assert_eq!(root["auth"]["profiles"]["x:1"]["provider"], json!("openai"));
        assert_eq!(root["auth"]["profiles"]["Groq:default"]["provider"], json!("groq"));
        assert!(root["models"]["providers"].get("mybox").is_some());
    }

    #[test]
    fn test_placeholder_tokens() {
        assert!(is_placeholder_token_profile(&json!({ "type": "token", "token": "Symbol(clack:cancel)" })));
        assert!(is_placeholder_token_profile(&json!({ "type": "token", "token": " " })));
        assert!(is_placeholder_token_profile(&json!({ "type": "token" })));
        assert!(is_placeholder_token_profile(&json!({ "type": "token", "token": null })));
        assert!(!is_placeholder_token_profile(&json!({ "type": "token", "token": "gsk-real" })));
        assert!(!is_placeholder_token_profile(&json!({ "type": "api_key", "key": "" })));
    }
}
