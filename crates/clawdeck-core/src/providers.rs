//! Provider credentials and inventory.
//!
//! Official providers are owned by the runtime: their credentials are only
//! ever written through [`AgentRuntime`], never by editing `models.providers`.
//! Custom providers are the one case written here directly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::activation::active_keys;
use crate::error::{ReconcileError, ReconcileResult};
use crate::layout;
use crate::merger::{CatalogSource, EndpointCatalogSource, SourceMerger};
use crate::model::{AuthMethod, Protocol, ProviderRecord};
use crate::normalize::{normalize_key, normalize_provider, provider_label};
use crate::runtime::{AgentRuntime, CatalogEntry, CredentialWrite, OAuthStart};
use crate::satellite::AuthProfileStore;
use crate::store::{BackupEntry, ConfigStore};

// ---------------------------------------------------------------------------
// Official provider table
// ---------------------------------------------------------------------------

/// Official API-key providers and the onboarding auth choice for each.
pub const API_KEY_PROVIDERS: [(&str, &str); 15] = [
    ("openai", "openai-api-key"),
    ("anthropic", "apiKey"),
    ("openrouter", "openrouter-api-key"),
    ("gemini", "gemini-api-key"),
    ("zai", "zai-api-key"),
    ("xiaomi", "xiaomi-api-key"),
    ("minimax", "minimax-api"),
    ("moonshot", "moonshot-api-key"),
    ("kimi-coding", "kimi-code-api-key"),
    ("opencode", "opencode-zen"),
    ("groq", "token"),
    ("mistral", "token"),
    ("xai", "token"),
    ("cerebras", "token"),
    ("huggingface", "token"),
];

/// Official providers authenticated through a browser or device-code flow.
pub const OAUTH_PROVIDERS: [&str; 2] = ["google-antigravity", "github-copilot"];

pub fn is_official_provider(provider: &str) -> bool {
    let provider = provider_label(provider);
    OAUTH_PROVIDERS.contains(&provider.as_str())
        || API_KEY_PROVIDERS.iter().any(|(id, _)| *id == provider)
}

/// Onboarding auth choice for an API-key provider.
pub fn resolve_auth_choice(provider: &str) -> Option<&'static str> {
    let provider = provider_label(provider);
    API_KEY_PROVIDERS
        .iter()
        .find(|(id, _)| *id == provider)
        .map(|(_, choice)| *choice)
}

/// Name of the onboarding flag that carries the key for `auth_choice`.
pub fn resolve_key_flag(provider: &str, auth_choice: &str) -> String {
    if auth_choice.ends_with("-api-key") {
        return auth_choice.to_string();
    }
    match auth_choice {
        "apiKey" => "anthropic-api-key".to_string(),
        "opencode-zen" => "opencode-zen-api-key".to_string(),
        _ => format!("{}-api-key", provider_label(provider)),
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOutcome {
    pub provider: String,
    pub auth_choice: String,
    pub backup: Option<BackupEntry>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CustomProviderRequest {
    pub provider: String,
    /// Wire protocol tag, one of [`Protocol::ALL`].
    pub api: String,
    pub base_url: String,
    /// Empty keeps the key already stored for this provider.
    pub api_key: String,
    pub discover_models: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProviderOutcome {
    pub provider: String,
    pub protocol: Protocol,
    pub changed: bool,
    pub backup: Option<BackupEntry>,
    pub discovered: usize,
    /// Discovery failures do not fail the registration.
    pub discovery_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub provider: String,
    pub removed_provider_config: bool,
    pub removed_active_models: Vec<String>,
    pub removed_profiles: Vec<String>,
    pub backup: Option<BackupEntry>,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// ProviderManager
// ---------------------------------------------------------------------------

pub struct ProviderManager {
    store: Arc<ConfigStore>,
    auth_store: Arc<AuthProfileStore>,
    merger: Arc<SourceMerger>,
    runtime: Arc<dyn AgentRuntime>,
    http_timeout: Duration,
}

fn provider_id(raw: &str) -> ReconcileResult<String> {
    normalize_provider(raw).ok_or_else(|| ReconcileError::validation("provider", "provider is empty"))
}

/// Profile fields that carry the credential itself.
const CREDENTIAL_FIELDS: [&str; 3] = ["key", "token", "apiKey"];

fn holds_credential(records: &BTreeMap<String, Value>, secret: &str) -> bool {
    records.values().any(|record| {
        CREDENTIAL_FIELDS
            .iter()
            .any(|field| record.get(*field).and_then(Value::as_str) == Some(secret))
    })
}

fn profile_belongs_to(id: &str, profile: &Value, provider: &str) -> bool {
    match profile.get("provider").and_then(Value::as_str) {
        Some(p) => provider_label(p) == provider,
        None => provider_label(id.split(':').next().unwrap_or("")) == provider,
    }
}

impl ProviderManager {
    pub fn new(
        store: Arc<ConfigStore>,
        auth_store: Arc<AuthProfileStore>,
        merger: Arc<SourceMerger>,
        runtime: Arc<dyn AgentRuntime>,
        http_timeout: Duration,
    ) -> Self {
        Self {
            store,
            auth_store,
            merger,
            runtime,
            http_timeout,
        }
    }

    /// Every provider seen in profiles, active models or `models.providers`.
    pub fn inventory(&self) -> ReconcileResult<Vec<ProviderRecord>> {
        let snapshot = self.store.read()?;
        let root = snapshot.root();
        let profiles = self.merger.profiles_by_provider()?;
        let active = active_keys(root);
        let configured = layout::object_at(root, layout::PROVIDERS).cloned().unwrap_or_default();

        let mut ids: BTreeSet<String> = profiles.keys().cloned().collect();
        ids.extend(active.iter().map(|k| k.provider().to_string()));
        ids.extend(configured.keys().map(|p| provider_label(p)));

        Ok(ids
            .into_iter()
            .map(|id| {
                let entry = configured
                    .get(&id)
                    .or_else(|| configured.iter().find(|(p, _)| provider_label(p) == id).map(|(_, v)| v));
                let text = |field: &str| {
                    entry
                        .and_then(|e| e.get(field))
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                let own_profiles = profiles.get(&id).map(Vec::as_slice).unwrap_or(&[]);
                let auth = if OAUTH_PROVIDERS.contains(&id.as_str())
                    || own_profiles.iter().any(|p| p.kind.as_deref() == Some("oauth"))
                {
                    AuthMethod::OAuth
                } else if entry.is_some() && !is_official_provider(&id) {
                    AuthMethod::Custom
                } else {
                    AuthMethod::ApiKey
                };
                ProviderRecord {
                    active_models: active.iter().filter(|k| k.belongs_to(&id)).count(),
                    profiles: own_profiles.len(),
                    base_url: text("baseUrl"),
                    protocol: text("api"),
                    auth,
                    id,
                }
            })
            .collect())
    }

    /// Hand an official API key to the runtime, then confirm a profile exists.
    pub async fn set_official_api_key(&self, provider: &str, api_key: &str) -> ReconcileResult<CredentialOutcome> {
        let provider = provider_id(provider)?;
        let auth_choice = resolve_auth_choice(&provider).ok_or_else(|| {
            ReconcileError::validation(
                "provider",
                format!("`{provider}` is not an official API-key provider"),
            )
        })?;
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ReconcileError::validation("apiKey", "API key is empty"));
        }

        if self.store.is_dry_run() {
            info!(target: "clawdeck::providers", provider = %provider, "dry-run: credential write skipped");
            return Ok(CredentialOutcome {
                provider,
                auth_choice: auth_choice.to_string(),
                backup: None,
                dry_run: true,
            });
        }

        let backup = if self.store.read()?.exists() {
            Some(self.store.backup()?)
        } else {
            None
        };
        let before = self.provider_profiles(&provider)?;
        let write = CredentialWrite {
            provider: provider.clone(),
            auth_choice: auth_choice.to_string(),
            key_flag: resolve_key_flag(&provider, auth_choice),
            api_key: api_key.to_string(),
        };
        self.runtime.write_official_credential(&write).await?;

        let after = self.provider_profiles(&provider)?;
        if after.is_empty() {
            return Err(ReconcileError::read_back(
                provider,
                "runtime accepted the credential but no auth profile was recorded",
            ));
        }
        // Re-submitting the stored key legitimately leaves the records as they were.
        if after == before && !holds_credential(&after, api_key) {
            return Err(ReconcileError::read_back(
                provider,
                "runtime accepted the credential but the provider's auth profiles did not change",
            ));
        }
        info!(target: "clawdeck::providers", provider = %provider, auth_choice, "official credential written");
        Ok(CredentialOutcome {
            provider,
            auth_choice: auth_choice.to_string(),
            backup,
            dry_run: false,
        })
    }

    /// Raw profile records for `provider` from both credential stores, keyed
    /// by store and profile id.
    fn provider_profiles(&self, provider: &str) -> ReconcileResult<BTreeMap<String, Value>> {
        let mut records = BTreeMap::new();
        let snapshot = self.store.read()?;
        if let Some(profiles) = layout::object_at(snapshot.root(), layout::AUTH_PROFILES) {
            for (id, profile) in profiles {
                if profile_belongs_to(id, profile, provider) {
                    records.insert(format!("config:{id}"), profile.clone());
                }
            }
        }
        let stored = self.auth_store.profiles().unwrap_or_else(|e| {
            warn!(target: "clawdeck::providers", error = %e, "auth-profile store unreadable during read-back");
            Map::new()
        });
        for (id, profile) in stored {
            if profile_belongs_to(&id, &profile, provider) {
                records.insert(format!("store:{id}"), profile);
            }
        }
        Ok(records)
    }

    pub async fn start_oauth(&self, provider: &str, method: Option<&str>) -> ReconcileResult<OAuthStart> {
        let provider = provider_id(provider)?;
        if !is_official_provider(&provider) {
            return Err(ReconcileError::validation(
                "provider",
                format!("`{provider}` is not an official provider"),
            ));
        }
        let method = method.map(str::trim).filter(|m| !m.is_empty());
        let start = self.runtime.start_oauth(&provider, method).await?;
        if !start.has_handoff() {
            warn!(target: "clawdeck::providers", provider = %provider, requires_tty = start.requires_tty, "OAuth start produced no URL or code");
        }
        Ok(start)
    }

    /// Write `models.providers[provider]` for a non-official provider, then
    /// optionally discover its models.
    pub async fn register_custom_provider(&self, request: &CustomProviderRequest) -> ReconcileResult<CustomProviderOutcome> {
        let provider = provider_id(&request.provider)?;
        if is_official_provider(&provider) {
            return Err(ReconcileError::validation(
                "provider",
                format!("`{provider}` is official; configure it through its credential flow"),
            ));
        }
        let protocol: Protocol = request.api.parse()?;
        let base_url = request.base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ReconcileError::validation(
                "baseUrl",
                format!("`{}` is not an http(s) URL", request.base_url),
            ));
        }
        let api_key = request.api_key.trim().to_string();

        let receipt = self.store.mutate(&format!("register custom provider {provider}"), |root| {
            let providers = layout::object_at_mut(root, layout::PROVIDERS)?;
            let mut entry = providers.get(&provider).and_then(Value::as_object).cloned().unwrap_or_default();
            entry.insert("api".to_string(), json!(protocol.as_str()));
            entry.insert("baseUrl".to_string(), json!(base_url));
            if !api_key.is_empty() {
                entry.insert("apiKey".to_string(), json!(api_key));
            }
            if !entry.get("models").map(Value::is_array).unwrap_or(false) {
                entry.insert("models".to_string(), json!([]));
            }
            providers.insert(provider.clone(), Value::Object(entry));
            Ok(())
        })?;

        let stored = layout::object_at(receipt.snapshot.root(), layout::PROVIDERS)
            .and_then(|p| p.get(&provider))
            .and_then(|p| p.get("baseUrl"))
            .and_then(Value::as_str);
        if stored != Some(base_url.as_str()) {
            return Err(ReconcileError::read_back(
                format!("models.providers.{provider}"),
                "provider entry missing after write",
            ));
        }
        info!(target: "clawdeck::providers", provider = %provider, protocol = %protocol, "custom provider saved");

        let (discovered, discovery_error) = if request.discover_models {
            match self.discover_models(&provider).await {
                Ok(models) => (models.len(), None),
                Err(e) => {
                    warn!(target: "clawdeck::providers", provider = %provider, error = %e, "model discovery failed; provider kept");
                    (0, Some(e.to_string()))
                }
            }
        } else {
            (0, None)
        };

        Ok(CustomProviderOutcome {
            provider,
            protocol,
            changed: receipt.changed,
            backup: receipt.backup,
            discovered,
            discovery_error,
        })
    }

    /// List a custom provider's models from its endpoint and store them as
    /// `[{id, name}]` under `models.providers[provider].models`.
    pub async fn discover_models(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        let provider = provider_id(provider)?;
        let snapshot = self.store.read()?;
        let entry = layout::object_at(snapshot.root(), layout::PROVIDERS)
            .and_then(|p| p.get(&provider))
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ReconcileError::validation("provider", format!("`{provider}` has no custom provider entry"))
            })?;
        let base_url = entry
            .get("baseUrl")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ReconcileError::validation("baseUrl", format!("`{provider}` has no baseUrl")))?;
        let api_key = entry.get("apiKey").and_then(Value::as_str).map(str::to_string);

        let source = EndpointCatalogSource::new(base_url, api_key, self.http_timeout);
        let entries = source.fetch(&provider).await?;
        let prefix = format!("{provider}/");
        let mut models: Vec<Value> = Vec::new();
        for entry in &entries {
            let id = match normalize_key(&entry.key) {
                Ok(key) if key.belongs_to(&provider) => key.name().to_string(),
                _ => entry.key.trim().trim_start_matches(prefix.as_str()).to_string(),
            };
            if id.is_empty() || models.iter().any(|m| m["id"] == id) {
                continue;
            }
            let name = if entry.name == entry.key { id.clone() } else { entry.name.clone() };
            models.push(json!({ "id": id, "name": name }));
        }

        self.store.mutate(&format!("store discovered models for {provider}"), |root| {
            let providers = layout::object_at_mut(root, layout::PROVIDERS)?;
            let entry = providers
                .get_mut(&provider)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    ReconcileError::validation("provider", format!("`{provider}` was removed during discovery"))
                })?;
            entry.insert("models".to_string(), Value::Array(models.clone()));
            Ok(())
        })?;
        info!(target: "clawdeck::providers", provider = %provider, models = entries.len(), "custom provider models discovered");
        Ok(entries)
    }

    /// Remove a provider everywhere clawdeck tracks it: its `models.providers`
    /// entry, its active models and its profiles in both credential stores.
    pub fn delete_provider(&self, provider: &str) -> ReconcileResult<DeleteOutcome> {
        let provider = provider_id(provider)?;
        let mut removed_provider_config = false;
        let mut removed_active_models = Vec::new();
        let mut removed_profiles = Vec::new();

        let receipt = self.store.mutate(&format!("delete provider {provider}"), |root| {
            if let Some(providers) = root.pointer_mut("/models/providers").and_then(Value::as_object_mut) {
                let doomed: Vec<String> = providers
                    .keys()
                    .filter(|p| provider_label(p) == provider)
                    .cloned()
                    .collect();
                for id in doomed {
                    providers.remove(&id);
                    removed_provider_config = true;
                }
            }
            if let Some(models) = root.pointer_mut("/agents/defaults/models").and_then(Value::as_object_mut) {
                let doomed: Vec<String> = models
                    .keys()
                    .filter(|k| normalize_key(k).map(|key| key.belongs_to(&provider)).unwrap_or(false))
                    .cloned()
                    .collect();
                for key in doomed {
                    models.remove(&key);
                    removed_active_models.push(key);
                }
            }
            if let Some(profiles) = root.pointer_mut("/auth/profiles").and_then(Value::as_object_mut) {
                let doomed: Vec<String> = profiles
                    .iter()
                    .filter(|(id, profile)| profile_belongs_to(id, profile, &provider))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in doomed {
                    profiles.remove(&id);
                    removed_profiles.push(id);
                }
            }
            Ok(())
        })?;

        if receipt.dry_run {
            let would_remove: Vec<String> = self
                .auth_store
                .profiles()?
                .iter()
                .filter(|(id, profile)| profile_belongs_to(id, profile, &provider))
                .map(|(id, _)| id.clone())
                .collect();
            removed_profiles.extend(would_remove);
        } else {
            for id in self
                .auth_store
                .remove_where(|id, profile| profile_belongs_to(id, profile, &provider))?
            {
                if !removed_profiles.contains(&id) {
                    removed_profiles.push(id);
                }
            }
        }
        removed_profiles.sort();
        removed_profiles.dedup();

        info!(
            target: "clawdeck::providers",
            provider = %provider,
            config = removed_provider_config,
            models = removed_active_models.len(),
            profiles = removed_profiles.len(),
            dry_run = receipt.dry_run,
            "provider deleted"
        );
        Ok(DeleteOutcome {
            provider,
            removed_provider_config,
            removed_active_models,
            removed_profiles,
            backup: receipt.backup,
            dry_run: receipt.dry_run,
        })
    }
}

/// Custom provider entries, keyed by provider id.
pub fn custom_providers(root: &Value) -> Map<String, Value> {
    layout::object_at(root, layout::PROVIDERS)
        .map(|providers| {
            providers
                .iter()
                .filter(|(id, _)| !is_official_provider(id))
                .map(|(id, v)| (id.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_choice_table() {
        assert_eq!(resolve_auth_choice("OpenAI"), Some("openai-api-key"));
        assert_eq!(resolve_auth_choice("anthropic"), Some("apiKey"));
        assert_eq!(resolve_auth_choice("groq"), Some("token"));
        assert_eq!(resolve_auth_choice("github-copilot"), None);
        assert_eq!(resolve_auth_choice("myprov"), None);
    }

    #[test]
    fn test_key_flag_resolution() {
        assert_eq!(resolve_key_flag("openai", "openai-api-key"), "openai-api-key");
        assert_eq!(resolve_key_flag("anthropic", "apiKey"), "anthropic-api-key");
        assert_eq!(resolve_key_flag("opencode", "opencode-zen"), "opencode-zen-api-key");
        assert_eq!(resolve_key_flag("minimax", "minimax-api"), "minimax-api-key");
        assert_eq!(resolve_key_flag("Groq", "token"), "groq-api-key");
    }

    #[test]
    fn test_official_detection() {
        assert!(is_official_provider("openrouter"));
        assert!(is_official_provider("GitHub-Copilot"));
        assert!(!is_official_provider("aliyun"));
    }

    #[test]
    fn test_profile_ownership() {
        assert!(profile_belongs_to("x", &json!({ "provider": "Groq" }), "groq"));
        assert!(profile_belongs_to("groq:default", &json!({}), "groq"));
        assert!(!profile_belongs_to("groqx:default", &json!({}), "groq"));
    }

    #[test]
    fn test_holds_credential() {
        let mut records = BTreeMap::new();
        records.insert("store:groq:default".to_string(), json!({ "type": "api_key", "key": "gsk-1" }));
        records.insert("store:groq:ci".to_string(), json!({ "type": "token", "token": "tok-2" }));
        assert!(holds_credential(&records, "gsk-1"));
        assert!(holds_credential(&records, "tok-2"));
        assert!(!holds_credential(&records, "gsk-2"));
    }

    #[test]
    fn test_custom_providers_filter() {
        let root = json!({ "models": { "providers": {
            "openrouter": { "baseUrl": "https://openrouter.ai/api/v1" },
            "mybox": { "baseUrl": "http://localhost:8000/v1", "api": "openai-chat" }
        } } });
        let custom = custom_providers(&root);
        assert_eq!(custom.keys().collect::<Vec<_>>(), vec!["mybox"]);
    }
}
