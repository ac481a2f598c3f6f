//! Request surface.
//!
//! [`ControlPlane`] wires every component over one set of files and exposes
//! the operations an operator front end needs. Every call returns
//! [`Outcome`], so callers see a flat `{ kind, field, reason }` failure
//! instead of the internal error enum.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::activation::{self, ActivationChange, ActivationEngine, ActiveModel, KeyOutcome};
use crate::backup::{BackupListing, BackupManager};
use crate::config::DeckConfig;
use crate::error::{ErrorKind, ReconcileError};
use crate::heal::{HealReport, SelfHeal};
use crate::merger::{CatalogReport, SourceMerger};
use crate::model::{AuthProfile, ConcurrencySource, DispatchPolicy, ModelPolicy, ProviderRecord};
use crate::normalize::ModelKey;
use crate::policy::{AgentOverride, DispatchRequest, EffectivePolicy, PolicyChange, PolicyReconciler};
use crate::providers::{
    CredentialOutcome, CustomProviderOutcome, CustomProviderRequest, DeleteOutcome, ProviderManager,
};
use crate::runtime::{AgentRuntime, CatalogEntry, OAuthStart};
use crate::satellite::{AuthProfileStore, CatalogCache, JsonFile};
use crate::search::{
    AdapterPatch, AdapterSettings, FailoverChain, OfficialSearch, OfficialSearchState, SearchSettings,
};
use crate::store::{ConfigStore, MutationReceipt, RestoreReceipt, StoreConfig};

/// Flat failure handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub field: Option<String>,
    pub reason: String,
}

impl From<ReconcileError> for Failure {
    fn from(err: ReconcileError) -> Self {
        Self {
            kind: err.kind(),
            field: err.subject().map(str::to_string),
            reason: err.to_string(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{:?} ({field}): {}", self.kind, self.reason),
            None => write!(f, "{:?}: {}", self.kind, self.reason),
        }
    }
}

impl std::error::Error for Failure {}

pub type Outcome<T> = Result<T, Failure>;

/// Merged view of everything clawdeck manages. Secrets are masked.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub config_exists: bool,
    pub dry_run: bool,
    pub active_models: Vec<ModelKey>,
    pub providers: Vec<ProviderRecord>,
    pub profiles: Vec<AuthProfile>,
    pub global_policy: ModelPolicy,
    pub spawn_policy: EffectivePolicy,
    pub agent_overrides: Vec<AgentOverride>,
    pub dispatch: Vec<DispatchPolicy>,
    pub max_concurrent: u32,
    pub max_concurrent_source: ConcurrencySource,
    pub official_search: OfficialSearchState,
    pub search_chain: FailoverChain,
    pub search_adapters: Value,
}

/// Keep the last four characters of anything that looks like a key.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

fn mask_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (field, inner) in map.iter_mut() {
                match inner {
                    Value::String(s) if field == "apiKey" && !s.is_empty() => *s = mask_secret(s),
                    _ => mask_keys(inner),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_keys),
        _ => {}
    }
}

pub struct ControlPlane {
    settings: DeckConfig,
    store: Arc<ConfigStore>,
    merger: Arc<SourceMerger>,
    activation: ActivationEngine,
    policy: PolicyReconciler,
    search: Arc<SearchSettings>,
    official_search: OfficialSearch,
    providers: ProviderManager,
    backups: BackupManager,
    heal: SelfHeal,
}

impl ControlPlane {
    /// Build every component over the files named in `settings`. Nothing is
    /// read or written until the first call.
    pub fn open(settings: DeckConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let store = Arc::new(ConfigStore::new(StoreConfig {
            config_path: settings.config_path.clone(),
            backup_dir: settings.backup_dir.clone(),
            dry_run: settings.dry_run,
        }));
        let auth_store = Arc::new(AuthProfileStore::new(settings.auth_profiles_path.clone()));
        let cache = CatalogCache::new(settings.models_cache_path.clone());
        let merger = Arc::new(SourceMerger::standard(
            store.clone(),
            auth_store.clone(),
            runtime.clone(),
            cache,
        ));
        let search = Arc::new(SearchSettings::new(JsonFile::new(settings.search_adapters_path.clone())));

        info!(
            target: "clawdeck::service",
            config = %settings.config_path.display(),
            dry_run = settings.dry_run,
            sources = ?merger.source_names(),
            "control plane ready"
        );

        Self {
            activation: ActivationEngine::new(store.clone()),
            policy: PolicyReconciler::new(
                store.clone(),
                search.clone(),
                settings.default_max_concurrent,
                settings.dispatch_default_allow,
            ),
            official_search: OfficialSearch::new(store.clone()),
            providers: ProviderManager::new(
                store.clone(),
                auth_store.clone(),
                merger.clone(),
                runtime,
                settings.http_timeout(),
            ),
            backups: BackupManager::new(store.clone(), settings.backup_list_limit),
            heal: SelfHeal::new(
                store.clone(),
                auth_store,
                search.clone(),
                vec![settings.search_adapters_path.clone()],
            ),
            search,
            merger,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &DeckConfig {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self) -> Outcome<StateView> {
        let snapshot = self.store.read()?;
        let root = snapshot.root();
        let agent_ids = self.policy.agent_ids()?;
        let dispatch = agent_ids
            .iter()
            .map(|id| self.policy.dispatch_status(id))
            .collect::<Result<Vec<_>, _>>()?;
        let (max_concurrent, max_concurrent_source) = self.policy.global_max_concurrent()?;
        let adapters = self.search.peek()?;
        let mut search_adapters = adapters.to_value();
        mask_keys(&mut search_adapters);

        Ok(StateView {
            config_exists: snapshot.exists(),
            dry_run: self.store.is_dry_run(),
            active_models: activation::active_keys(root).into_iter().collect(),
            providers: self.providers.inventory()?,
            profiles: self.merger.merged_auth_profiles()?,
            global_policy: self.policy.global_policy()?,
            spawn_policy: self.policy.effective_spawn_policy()?,
            agent_overrides: self.policy.agent_overrides()?,
            dispatch,
            max_concurrent,
            max_concurrent_source,
            official_search: self.official_search.state()?,
            search_chain: adapters.effective_chain(),
            search_adapters,
        })
    }

    /// Catalog for one provider from the highest-priority source that answers.
    pub async fn catalog(&self, provider: &str) -> Outcome<CatalogReport> {
        Ok(self.merger.merged_catalog(provider).await?)
    }

    /// Active keys of `provider` annotated against its current catalog.
    pub async fn active_models(&self, provider: &str) -> Outcome<Vec<ActiveModel>> {
        let report = self.merger.merged_catalog(provider).await?;
        let active = self.activation.list_active()?;
        let owned: std::collections::BTreeSet<ModelKey> = active
            .into_iter()
            .filter(|k| k.belongs_to(&report.provider))
            .collect();
        Ok(activation::annotate(&owned, std::slice::from_ref(&report)))
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    pub fn activate(&self, key: &str) -> Outcome<ActivationChange> {
        Ok(self.activation.activate(key)?)
    }

    pub fn deactivate(&self, key: &str) -> Outcome<ActivationChange> {
        Ok(self.activation.deactivate(key)?)
    }

    /// Per-key outcomes; one bad key never blocks the rest.
    pub fn activate_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<KeyOutcome> {
        self.activation.activate_many(keys)
    }

    pub fn deactivate_many<S: AsRef<str>>(&self, keys: &[S]) -> Vec<KeyOutcome> {
        self.activation.deactivate_many(keys)
    }

    // -----------------------------------------------------------------------
    // Model policy
    // -----------------------------------------------------------------------

    pub fn set_global_policy<S: AsRef<str>>(&self, primary: Option<&str>, fallbacks: &[S]) -> Outcome<PolicyChange> {
        Ok(self.policy.set_global_policy(primary, fallbacks)?)
    }

    pub fn set_agent_policy<S: AsRef<str>>(
        &self,
        agent_id: &str,
        primary: Option<&str>,
        fallbacks: &[S],
    ) -> Outcome<PolicyChange> {
        Ok(self.policy.set_agent_policy(agent_id, primary, fallbacks)?)
    }

    pub fn clear_agent_policy(&self, agent_id: &str) -> Outcome<PolicyChange> {
        Ok(self.policy.clear_agent_policy(agent_id)?)
    }

    pub fn set_spawn_policy<S: AsRef<str>>(&self, primary: Option<&str>, fallbacks: &[S]) -> Outcome<PolicyChange> {
        Ok(self.policy.set_spawn_policy(primary, fallbacks)?)
    }

    pub fn clear_spawn_policy(&self) -> Outcome<PolicyChange> {
        Ok(self.policy.clear_spawn_policy()?)
    }

    pub fn effective_policy(&self, agent_id: &str) -> Outcome<EffectivePolicy> {
        Ok(self.policy.effective_policy(agent_id)?)
    }

    pub fn effective_spawn_policy(&self) -> Outcome<EffectivePolicy> {
        Ok(self.policy.effective_spawn_policy()?)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    pub fn dispatch_status(&self, agent_id: &str) -> Outcome<DispatchPolicy> {
        Ok(self.policy.dispatch_status(agent_id)?)
    }

    pub fn set_dispatch_policy(&self, agent_id: &str, request: &DispatchRequest) -> Outcome<DispatchPolicy> {
        Ok(self.policy.set_dispatch_policy(agent_id, request)?)
    }

    pub fn set_global_max_concurrent(&self, max_concurrent: i64) -> Outcome<bool> {
        Ok(self.policy.set_global_max_concurrent(max_concurrent)?)
    }

    // -----------------------------------------------------------------------
    // Providers
    // -----------------------------------------------------------------------

    pub fn providers(&self) -> Outcome<Vec<ProviderRecord>> {
        Ok(self.providers.inventory()?)
    }

    pub async fn set_official_api_key(&self, provider: &str, api_key: &str) -> Outcome<CredentialOutcome> {
        Ok(self.providers.set_official_api_key(provider, api_key).await?)
    }

    pub async fn start_oauth(&self, provider: &str, method: Option<&str>) -> Outcome<OAuthStart> {
        Ok(self.providers.start_oauth(provider, method).await?)
    }

    pub async fn register_custom_provider(&self, request: &CustomProviderRequest) -> Outcome<CustomProviderOutcome> {
        Ok(self.providers.register_custom_provider(request).await?)
    }

    pub async fn discover_models(&self, provider: &str) -> Outcome<Vec<CatalogEntry>> {
        Ok(self.providers.discover_models(provider).await?)
    }

    pub fn delete_provider(&self, provider: &str) -> Outcome<DeleteOutcome> {
        Ok(self.providers.delete_provider(provider)?)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub fn set_official_search(&self, provider: &str, api_key: Option<&str>, make_default: bool) -> Outcome<MutationReceipt> {
        Ok(self.official_search.set(provider, api_key, make_default)?)
    }

    pub fn clear_official_search(&self, provider: &str) -> Outcome<MutationReceipt> {
        Ok(self.official_search.clear(provider)?)
    }

    pub fn update_search_adapter(&self, id: &str, patch: &AdapterPatch) -> Outcome<AdapterSettings> {
        Ok(self.search.update_adapter(id, patch)?)
    }

    pub fn set_search_failover_chain<S: AsRef<str>>(&self, primary: Option<&str>, fallbacks: &[S]) -> Outcome<FailoverChain> {
        Ok(self.policy.set_search_failover_chain(primary, fallbacks)?)
    }

    pub fn search_failover_chain(&self) -> Outcome<FailoverChain> {
        Ok(self.search.effective_chain()?)
    }

    // -----------------------------------------------------------------------
    // Backups
    // -----------------------------------------------------------------------

    pub fn list_backups(&self, limit: Option<usize>) -> Outcome<Vec<BackupListing>> {
        Ok(self.backups.list(limit)?)
    }

    pub fn rollback(&self, name: &str) -> Outcome<RestoreReceipt> {
        Ok(self.backups.rollback(name)?)
    }

    // -----------------------------------------------------------------------
    // Self-heal
    // -----------------------------------------------------------------------

    pub fn self_heal(&self) -> Outcome<HealReport> {
        self.heal.run().map_err(|e| {
            warn!(target: "clawdeck::service", error = %e, "self-heal failed");
            Failure::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::OfflineRuntime;
    use serde_json::json;

    #[test]
    fn test_failure_from_error() {
        let failure = Failure::from(ReconcileError::validation("maxConcurrent", "must be at least 1"));
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert_eq!(failure.field.as_deref(), Some("maxConcurrent"));
        assert!(failure.reason.contains("must be at least 1"));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("sk-abcdef123456"), "****3456");

        let mut value = json!({ "providers": { "tavily": { "apiKey": "tvly-0123456789" , "model": "x" } } });
        mask_keys(&mut value);
        assert_eq!(value["providers"]["tavily"]["apiKey"], json!("****6789"));
        assert_eq!(value["providers"]["tavily"]["model"], json!("x"));
    }

    #[test]
    fn test_state_on_empty_home() {
        let dir = tempfile::tempdir().unwrap();
        let plane = ControlPlane::open(DeckConfig::rooted(dir.path()), Arc::new(OfflineRuntime));
        let state = plane.state().unwrap();
        assert!(!state.config_exists);
        assert!(state.active_models.is_empty());
        assert_eq!(state.max_concurrent, 8);
        assert_eq!(state.max_concurrent_source, ConcurrencySource::Default);
    }

    #[test]
    fn test_validation_failure_is_flat() {
        let dir = tempfile::tempdir().unwrap();
        let plane = ControlPlane::open(DeckConfig::rooted(dir.path()), Arc::new(OfflineRuntime));
        let failure = plane.set_global_max_concurrent(0).unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Validation);
        assert!(!dir.path().join("openclaw.json").exists());
    }
}
