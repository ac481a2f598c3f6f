//! Source Merger
//!
//! ## Catalogs
//!
//! A catalog is assembled from an ordered list of [`CatalogSource`]s. Sources
//! are tried in declared order and the first one returning a non-empty list
//! wins. The live runtime query is always declared ahead of the cached file:
//! a cache holding only a placeholder entry must never shadow a live answer.
//! When every source fails, the report says so (`Freshness::Unknown`) along
//! with each source's reason, rather than returning an empty success.
//!
//! ## Auth profiles
//!
//! Profiles are the union of `auth.profiles` in the primary file and the
//! runtime's `auth-profiles.json`, keyed by profile id. Stores are observed in
//! that order and a later observation wins field by field; both source tags
//! are kept and disagreements are logged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::layout;
use crate::model::{AuthProfile, Availability, ModelRecord, ProfileSource};
use crate::normalize::{normalize_key, normalize_provider, provider_label, ModelKey};
use crate::runtime::{AgentRuntime, CatalogEntry};
use crate::satellite::{AuthProfileStore, CatalogCache};
use crate::store::ConfigStore;

// ---------------------------------------------------------------------------
// Catalog sources
// ---------------------------------------------------------------------------

/// How current a catalog answer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Answered by the upstream just now.
    Live,
    /// Answered from a snapshot that may be stale.
    Cached,
    /// No source answered.
    Unknown,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;
    fn freshness(&self) -> Freshness;
    async fn fetch(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>>;
}

/// Live listing through the runtime.
pub struct LiveCatalogSource {
    runtime: Arc<dyn AgentRuntime>,
}

impl LiveCatalogSource {
    pub fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl CatalogSource for LiveCatalogSource {
    fn name(&self) -> &str {
        "runtime"
    }

    fn freshness(&self) -> Freshness {
        Freshness::Live
    }

    async fn fetch(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        self.runtime.query_catalog(provider).await
    }
}

/// The runtime's cached `models.json`.
pub struct CachedCatalogSource {
    cache: CatalogCache,
}

impl CachedCatalogSource {
    pub fn new(cache: CatalogCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CatalogSource for CachedCatalogSource {
    fn name(&self) -> &str {
        "models-cache"
    }

    fn freshness(&self) -> Freshness {
        Freshness::Cached
    }

    async fn fetch(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        Ok(self
            .cache
            .provider_models(provider)?
            .iter()
            .filter_map(CatalogEntry::from_value)
            .collect())
    }
}

/// An OpenAI-compatible `GET {base}/v1/models` listing, used for custom providers.
pub struct EndpointCatalogSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl EndpointCatalogSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("clawdeck")
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
        }
    }

    /// `{base}/models` when the base already ends in `/v1`, else `{base}/v1/models`.
    pub fn models_url(base_url: &str) -> String {
        let base = base_url.trim().trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/models")
        } else {
            format!("{base}/v1/models")
        }
    }
}

#[async_trait]
impl CatalogSource for EndpointCatalogSource {
    fn name(&self) -> &str {
        "endpoint"
    }

    fn freshness(&self) -> Freshness {
        Freshness::Live
    }

    async fn fetch(&self, _provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        let url = Self::models_url(&self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReconcileError::CollaboratorTimeout(self.timeout)
            } else {
                ReconcileError::CollaboratorUnavailable(format!("GET {url}: {e}"))
            }
        })?;
        if !response.status().is_success() {
            return Err(ReconcileError::CollaboratorUnavailable(format!(
                "GET {url}: HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ReconcileError::CollaboratorUnavailable(format!("GET {url}: {e}")))?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|data| data.iter().filter_map(CatalogEntry::from_value).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Catalog report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogReport {
    pub provider: String,
    pub models: Vec<ModelRecord>,
    pub freshness: Freshness,
    /// Name of the source that answered.
    pub source: Option<String>,
    /// Sources tried before the answer, with why they were skipped.
    pub skipped: Vec<SourceFailure>,
}

impl CatalogReport {
    /// Anything short of a live answer is flagged stale for display.
    pub fn is_stale(&self) -> bool {
        self.freshness != Freshness::Live
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.models.iter().any(|m| &m.key == key)
    }
}

/// Attribute a raw catalog key to `provider`: `vendor/model` returned for
/// provider `p` becomes `p/vendor/model`.
pub fn attribute_key(provider: &str, raw: &str) -> ReconcileResult<ModelKey> {
    let direct = normalize_key(raw)?;
    let explicit = raw.contains('/');
    if explicit && direct.belongs_to(provider) {
        return Ok(direct);
    }
    let name = raw.trim().trim_matches(['\'', '"']);
    normalize_key(&format!("{provider}/{name}"))
}

/// Resolve catalogs through an ordered list of sources.
pub async fn resolve_catalog(
    sources: &[Box<dyn CatalogSource>],
    provider: &str,
) -> ReconcileResult<CatalogReport> {
    let provider = normalize_provider(provider)
        .ok_or_else(|| ReconcileError::validation("provider", "provider is empty"))?;

    let mut skipped = Vec::new();
    for source in sources {
        let entries = match source.fetch(&provider).await {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                debug!(target: "clawdeck::merger", provider = %provider, source = source.name(), "source returned no models");
                skipped.push(SourceFailure {
                    source: source.name().to_string(),
                    reason: "empty result".to_string(),
                });
                continue;
            }
            Err(e) => {
                warn!(target: "clawdeck::merger", provider = %provider, source = source.name(), error = %e, "catalog source failed; trying next");
                skipped.push(SourceFailure {
                    source: source.name().to_string(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let availability = match source.freshness() {
            Freshness::Live => Availability::Available,
            _ => Availability::Unknown,
        };
        let mut models: Vec<ModelRecord> = Vec::new();
        for entry in entries {
            match attribute_key(&provider, &entry.key) {
                Ok(key) if !models.iter().any(|m| m.key == key) => models.push(ModelRecord {
                    key,
                    name: entry.name,
                    availability,
                }),
                Ok(_) => {}
                Err(e) => debug!(target: "clawdeck::merger", raw = %entry.key, error = %e, "dropping unusable catalog entry"),
            }
        }

        return Ok(CatalogReport {
            provider,
            models,
            freshness: source.freshness(),
            source: Some(source.name().to_string()),
            skipped,
        });
    }

    warn!(target: "clawdeck::merger", provider = %provider, "no catalog source answered; result is unknown");
    Ok(CatalogReport {
        provider,
        models: Vec::new(),
        freshness: Freshness::Unknown,
        source: None,
        skipped,
    })
}

// ---------------------------------------------------------------------------
// SourceMerger
// ---------------------------------------------------------------------------

pub struct SourceMerger {
    sources: Vec<Box<dyn CatalogSource>>,
    store: Arc<ConfigStore>,
    auth_store: Arc<AuthProfileStore>,
}

impl SourceMerger {
    pub fn new(store: Arc<ConfigStore>, auth_store: Arc<AuthProfileStore>) -> Self {
        Self {
            sources: Vec::new(),
            store,
            auth_store,
        }
    }

    /// Append a catalog source; earlier sources take priority.
    pub fn with_source(mut self, source: Box<dyn CatalogSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Live runtime first, cached file second.
    pub fn standard(
        store: Arc<ConfigStore>,
        auth_store: Arc<AuthProfileStore>,
        runtime: Arc<dyn AgentRuntime>,
        cache: CatalogCache,
    ) -> Self {
        Self::new(store, auth_store)
            .with_source(Box::new(LiveCatalogSource::new(runtime)))
            .with_source(Box::new(CachedCatalogSource::new(cache)))
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn merged_catalog(&self, provider: &str) -> ReconcileResult<CatalogReport> {
        resolve_catalog(&self.sources, provider).await
    }

    /// Union of both credential stores, sorted by profile id.
    pub fn merged_auth_profiles(&self) -> ReconcileResult<Vec<AuthProfile>> {
        let snapshot = self.store.read()?;
        let from_config = layout::object_at(snapshot.root(), layout::AUTH_PROFILES)
            .cloned()
            .unwrap_or_default();
        let from_store = match self.auth_store.profiles() {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(target: "clawdeck::merger", path = %self.auth_store.path().display(), error = %e, "auth-profile store unreadable; using primary config only");
                Map::new()
            }
        };
        Ok(merge_profiles(&[
            (ProfileSource::Config, &from_config),
            (ProfileSource::AuthStore, &from_store),
        ]))
    }

    pub fn profiles_by_provider(&self) -> ReconcileResult<BTreeMap<String, Vec<AuthProfile>>> {
        let mut grouped: BTreeMap<String, Vec<AuthProfile>> = BTreeMap::new();
        for profile in self.merged_auth_profiles()? {
            grouped.entry(profile.provider.clone()).or_default().push(profile);
        }
        Ok(grouped)
    }
}

/// Fields whose values are secrets and must never reach a log line.
const SECRET_FIELDS: [&str; 5] = ["key", "token", "apiKey", "access", "refresh"];

struct Observed {
    fields: Map<String, Value>,
    sources: Vec<ProfileSource>,
    conflicts: Vec<String>,
}

/// Merge profile maps observed in order. On an id collision the most
/// recently observed record wins whole; sources accumulate.
pub fn merge_profiles(observations: &[(ProfileSource, &Map<String, Value>)]) -> Vec<AuthProfile> {
    let mut merged: BTreeMap<String, Observed> = BTreeMap::new();

    for (source, profiles) in observations {
        for (id, info) in profiles.iter() {
            let Some(info) = info.as_object() else {
                debug!(target: "clawdeck::merger", profile = %id, "skipping non-object profile entry");
                continue;
            };
            let slot = merged.entry(id.clone()).or_insert_with(|| Observed {
                fields: Map::new(),
                sources: Vec::new(),
                conflicts: Vec::new(),
            });

            for (field, value) in info {
                if let Some(previous) = slot.fields.get(field) {
                    if previous != value && !slot.conflicts.contains(field) {
                        slot.conflicts.push(field.clone());
                        let shown = if SECRET_FIELDS.contains(&field.as_str()) {
                            format!("`{field}` differs")
                        } else {
                            format!("`{field}`: {previous} -> {value}")
                        };
                        let conflict = ReconcileError::MergeConflict {
                            profile_id: id.clone(),
                            detail: shown,
                        };
                        warn!(target: "clawdeck::merger", error = %conflict, "profile stores disagree; later store wins");
                    }
                }
            }
            // The most recent record replaces the earlier one whole.
            slot.fields = info.clone();
            if !slot.sources.contains(source) {
                slot.sources.push(*source);
            }
        }
    }

    merged
        .into_iter()
        .map(|(id, observed)| {
            let text = |field: &str| {
                observed
                    .fields
                    .get(field)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let provider = text("provider")
                .map(|p| provider_label(&p))
                .unwrap_or_else(|| provider_label(id.split(':').next().unwrap_or("")));
            let label = text("label")
                .or_else(|| text("email"))
                .unwrap_or_else(|| id.clone());
            let kind = text("mode").or_else(|| text("type"));
            AuthProfile {
                id,
                provider,
                label,
                kind,
                sources: observed.sources,
                conflicts: observed.conflicts,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        name: &'static str,
        freshness: Freshness,
        result: Result<Vec<&'static str>, &'static str>,
        calls: AtomicUsize,
    }

    impl FixedSource {
        fn boxed(
            name: &'static str,
            freshness: Freshness,
            result: Result<Vec<&'static str>, &'static str>,
        ) -> Box<dyn CatalogSource> {
            Box::new(Self {
                name,
                freshness,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CatalogSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn freshness(&self) -> Freshness {
            self.freshness
        }

        async fn fetch(&self, _provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(keys) => Ok(keys
                    .iter()
                    .map(|k| CatalogEntry {
                        key: k.to_string(),
                        name: k.to_string(),
                    })
                    .collect()),
                Err(reason) => Err(ReconcileError::CollaboratorUnavailable(reason.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_live_result_shadows_cache() {
        let sources = vec![
            FixedSource::boxed("live", Freshness::Live, Ok(vec!["openrouter/anthropic/claude-3", "openrouter/auto"])),
            FixedSource::boxed("cache", Freshness::Cached, Ok(vec!["openrouter/auto"])),
        ];
        let report = resolve_catalog(&sources, "OpenRouter").await.unwrap();
        assert_eq!(report.freshness, Freshness::Live);
        assert_eq!(report.models.len(), 2);
        assert!(report.skipped.is_empty());
        assert!(report.models.iter().all(|m| m.availability == Availability::Available));
    }

    #[tokio::test]
    async fn test_failed_or_empty_live_falls_back() {
        let sources = vec![
            FixedSource::boxed("live", Freshness::Live, Err("spawn failed")),
            FixedSource::boxed("cache", Freshness::Cached, Ok(vec!["auto"])),
        ];
        let report = resolve_catalog(&sources, "openrouter").await.unwrap();
        assert_eq!(report.freshness, Freshness::Cached);
        assert!(report.is_stale());
        assert_eq!(report.models[0].key.as_str(), "openrouter/auto");
        assert_eq!(report.models[0].availability, Availability::Unknown);
        assert_eq!(report.skipped[0].source, "live");

        let sources = vec![
            FixedSource::boxed("live", Freshness::Live, Ok(vec![])),
            FixedSource::boxed("cache", Freshness::Cached, Ok(vec!["auto"])),
        ];
        let report = resolve_catalog(&sources, "openrouter").await.unwrap();
        assert_eq!(report.source.as_deref(), Some("cache"));
        assert_eq!(report.skipped[0].reason, "empty result");
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_unknown() {
        let sources = vec![
            FixedSource::boxed("live", Freshness::Live, Err("timeout")),
            FixedSource::boxed("cache", Freshness::Cached, Ok(vec![])),
        ];
        let report = resolve_catalog(&sources, "groq").await.unwrap();
        assert_eq!(report.freshness, Freshness::Unknown);
        assert!(report.models.is_empty());
        assert_eq!(report.skipped.len(), 2);
    }

    #[test]
    fn test_attribute_key() {
        assert_eq!(attribute_key("groq", "groq/llama").unwrap().as_str(), "groq/llama");
        assert_eq!(attribute_key("groq", "llama").unwrap().as_str(), "groq/llama");
        assert_eq!(
            attribute_key("mybox", "meta-llama/Llama-3").unwrap().as_str(),
            "mybox/meta-llama/Llama-3"
        );
        assert_eq!(attribute_key("groq", "'Groq/llama'").unwrap().as_str(), "groq/llama");
    }

    #[test]
    fn test_endpoint_models_url() {
        assert_eq!(
            EndpointCatalogSource::models_url("http://localhost:8000/v1/"),
            "http://localhost:8000/v1/models"
        );
        assert_eq!(
            EndpointCatalogSource::models_url("https://api.example.com"),
            "https://api.example.com/v1/models"
        );
    }

    #[test]
    fn test_merge_profiles_last_observed_wins() {
        let config = json!({
            "openai:default": { "provider": "openai", "mode": "api_key" },
            "groq:default": { "provider": "Groq", "mode": "token" }
        });
        let store = json!({
            "openai:default": { "provider": "openai", "type": "api_key", "key": "sk-x", "mode": "oauth" },
            "anthropic:me": { "provider": "anthropic", "type": "token", "email": "me@example.com" }
        });
        let merged = merge_profiles(&[
            (ProfileSource::Config, config.as_object().unwrap()),
            (ProfileSource::AuthStore, store.as_object().unwrap()),
        ]);

        assert_eq!(merged.len(), 3);
        let openai = merged.iter().find(|p| p.id == "openai:default").unwrap();
        assert_eq!(openai.kind.as_deref(), Some("oauth"));
        assert_eq!(openai.sources, vec![ProfileSource::Config, ProfileSource::AuthStore]);
        assert_eq!(openai.conflicts, vec!["mode".to_string()]);

        let groq = merged.iter().find(|p| p.id == "groq:default").unwrap();
        assert_eq!(groq.provider, "groq");
        assert_eq!(groq.sources, vec![ProfileSource::Config]);

        let anthropic = merged.iter().find(|p| p.id == "anthropic:me").unwrap();
        assert_eq!(anthropic.label, "me@example.com");
    }

    #[test]
    fn test_merge_profiles_drops_fields_missing_from_newer_record() {
        let config = json!({ "xai:default": { "provider": "xai", "mode": "api_key", "label": "stale" } });
        let store = json!({ "xai:default": { "provider": "xai", "type": "token", "token": "t" } });
        let merged = merge_profiles(&[
            (ProfileSource::Config, config.as_object().unwrap()),
            (ProfileSource::AuthStore, store.as_object().unwrap()),
        ]);

        assert_eq!(merged[0].kind.as_deref(), Some("token"));
        assert_eq!(merged[0].label, "xai:default");
        assert!(merged[0].conflicts.is_empty());
    }
}
