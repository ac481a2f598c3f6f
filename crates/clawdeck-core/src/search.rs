//! Search routing configuration.
//!
//! Two namespaces of sources feed the failover chain: `official:<id>`, backed
//! by the runtime's own `tools.web.search` section, and `adapter:<id>`, whose
//! settings live in clawdeck's adapter file. The chain itself is stored in the
//! adapter file together with the legacy adapter-only fields older readers use.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::layout;
use crate::satellite::JsonFile;
use crate::store::{ConfigStore, MutationReceipt};

pub const OFFICIAL_SOURCES: [&str; 5] = ["brave", "perplexity", "grok", "gemini", "kimi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSpec {
    pub id: &'static str,
    pub label: &'static str,
    pub default_base_url: &'static str,
}

pub const ADAPTERS: [AdapterSpec; 3] = [
    AdapterSpec {
        id: "zhipu",
        label: "Zhipu Web Search",
        default_base_url: "https://open.bigmodel.cn/api/paas/v4/web_search",
    },
    AdapterSpec {
        id: "serper",
        label: "Serper",
        default_base_url: "https://google.serper.dev/search",
    },
    AdapterSpec {
        id: "tavily",
        label: "Tavily",
        default_base_url: "https://api.tavily.com/search",
    },
];

pub const TOP_K_RANGE: (i64, i64) = (1, 20);
pub const COOLDOWN_RANGE: (i64, i64) = (5, 3600);
const DEFAULT_TOP_K: u32 = 5;
const DEFAULT_COOLDOWN_SECS: u32 = 60;

pub fn adapter_spec(id: &str) -> Option<&'static AdapterSpec> {
    let id = id.trim().to_ascii_lowercase();
    ADAPTERS.iter().find(|spec| spec.id == id)
}

pub fn is_official_source(id: &str) -> bool {
    OFFICIAL_SOURCES.contains(&id.trim().to_ascii_lowercase().as_str())
}

// ---------------------------------------------------------------------------
// Source references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceRef {
    Official(String),
    Adapter(String),
}

impl SourceRef {
    /// Parse `official:<id>` or `adapter:<id>`. Unknown namespaces and ids are
    /// rejected with the entry named.
    pub fn parse(raw: &str) -> ReconcileResult<Self> {
        let entry = raw.trim().to_ascii_lowercase();
        let reject = |why: &str| ReconcileError::validation("searchSource", format!("`{raw}`: {why}"));
        let (namespace, id) = entry
            .split_once(':')
            .ok_or_else(|| reject("expected `official:<id>` or `adapter:<id>`"))?;
        let id = id.trim();
        match namespace.trim() {
            "official" if is_official_source(id) => Ok(SourceRef::Official(id.to_string())),
            "official" => Err(reject(&format!(
                "unknown official source (expected one of {})",
                OFFICIAL_SOURCES.join(", ")
            ))),
            "adapter" if adapter_spec(id).is_some() => Ok(SourceRef::Adapter(id.to_string())),
            "adapter" => Err(reject(&format!(
                "unknown adapter (expected one of {})",
                ADAPTERS.iter().map(|a| a.id).collect::<Vec<_>>().join(", ")
            ))),
            _ => Err(reject("unknown namespace")),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SourceRef::Official(id) | SourceRef::Adapter(id) => id,
        }
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self, SourceRef::Adapter(_))
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Official(id) => write!(f, "official:{id}"),
            SourceRef::Adapter(id) => write!(f, "adapter:{id}"),
        }
    }
}

impl FromStr for SourceRef {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SourceRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Ordered unique chain, primary first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailoverChain {
    pub primary: Option<SourceRef>,
    pub fallbacks: Vec<SourceRef>,
}

impl FailoverChain {
    /// Validate every entry; the first bad one fails the whole chain.
    pub fn parse<S: AsRef<str>>(primary: Option<&str>, fallbacks: &[S]) -> ReconcileResult<Self> {
        let primary = match primary.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => Some(SourceRef::parse(raw)?),
            None => None,
        };
        let mut out: Vec<SourceRef> = Vec::new();
        for raw in fallbacks {
            if raw.as_ref().trim().is_empty() {
                continue;
            }
            let source = SourceRef::parse(raw.as_ref())?;
            if Some(&source) != primary.as_ref() && !out.contains(&source) {
                out.push(source);
            }
        }
        Ok(Self {
            primary,
            fallbacks: out,
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRef> {
        self.primary.iter().chain(self.fallbacks.iter())
    }
}

// ---------------------------------------------------------------------------
// Adapter file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSettings {
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub top_k: u32,
    pub cooldown_seconds: u32,
}

impl AdapterSettings {
    fn defaults(spec: &AdapterSpec) -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            base_url: spec.default_base_url.to_string(),
            model: String::new(),
            top_k: DEFAULT_TOP_K,
            cooldown_seconds: DEFAULT_COOLDOWN_SECS,
        }
    }

    /// Overlay whatever fields `raw` carries, clamping numbers into range.
    fn overlay(mut self, raw: &Map<String, Value>) -> Self {
        if let Some(enabled) = raw.get("enabled").and_then(Value::as_bool) {
            self.enabled = enabled;
        }
        if let Some(key) = raw.get("apiKey").and_then(Value::as_str) {
            self.api_key = key.to_string();
        }
        if let Some(url) = raw.get("baseUrl").and_then(Value::as_str).filter(|u| !u.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(model) = raw.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
        if let Some(top_k) = raw.get("topK").and_then(as_int) {
            self.top_k = clamp(top_k, TOP_K_RANGE);
        }
        if let Some(cooldown) = raw.get("cooldownSeconds").and_then(as_int) {
            self.cooldown_seconds = clamp(cooldown, COOLDOWN_RANGE);
        }
        self
    }

    fn to_value(&self) -> Value {
        json!({
            "enabled": self.enabled,
            "apiKey": self.api_key,
            "baseUrl": self.base_url,
            "model": self.model,
            "topK": self.top_k,
            "cooldownSeconds": self.cooldown_seconds,
        })
    }
}

/// Accepts integers and numeric strings, as older writers stored both.
fn as_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn clamp(value: i64, (lo, hi): (i64, i64)) -> u32 {
    value.clamp(lo, hi) as u32
}

/// Partial update for one adapter; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct AdapterPatch {
    pub enabled: Option<bool>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub top_k: Option<i64>,
    pub cooldown_seconds: Option<i64>,
}

/// Parsed adapter file with every adapter present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAdapterFile {
    pub primary_source: String,
    pub fallback_sources: Vec<String>,
    pub active_source: String,
    /// Legacy adapter-only fields.
    pub primary: String,
    pub active: String,
    pub fallbacks: Vec<String>,
    pub providers: Vec<(String, AdapterSettings)>,
}

fn lower_unique(raw: Option<&Value>, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.and_then(Value::as_array).into_iter().flatten() {
        let Some(id) = item.as_str().map(|s| s.trim().to_ascii_lowercase()) else {
            continue;
        };
        if !id.is_empty() && keep(&id) && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

impl SearchAdapterFile {
    pub fn defaults() -> Self {
        Self::from_value(&Value::Object(Map::new()))
    }

    /// Merge a possibly partial file over the defaults.
    pub fn from_value(raw: &Value) -> Self {
        let text = |field: &str| {
            raw.get(field)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_ascii_lowercase())
                .unwrap_or_default()
        };
        let active = text("active");
        let primary = Some(text("primary")).filter(|p| !p.is_empty()).unwrap_or_else(|| active.clone());
        let stored = raw.get("providers").and_then(Value::as_object);
        let providers = ADAPTERS
            .iter()
            .map(|spec| {
                let settings = AdapterSettings::defaults(spec);
                let settings = match stored.and_then(|p| p.get(spec.id)).and_then(Value::as_object) {
                    Some(raw) => settings.overlay(raw),
                    None => settings,
                };
                (spec.id.to_string(), settings)
            })
            .collect();
        Self {
            primary_source: text("primarySource"),
            fallback_sources: lower_unique(raw.get("fallbackSources"), |_| true),
            active_source: text("activeSource"),
            primary,
            active,
            fallbacks: lower_unique(raw.get("fallbacks"), |id| adapter_spec(id).is_some()),
            providers,
        }
    }

    pub fn to_value(&self) -> Value {
        let providers: Map<String, Value> = self
            .providers
            .iter()
            .map(|(id, settings)| (id.clone(), settings.to_value()))
            .collect();
        json!({
            "active": self.active,
            "primary": self.primary,
            "fallbacks": self.fallbacks,
            "primarySource": self.primary_source,
            "fallbackSources": self.fallback_sources,
            "activeSource": self.active_source,
            "providers": providers,
        })
    }

    pub fn adapter(&self, id: &str) -> Option<&AdapterSettings> {
        self.providers.iter().find(|(pid, _)| pid == id).map(|(_, s)| s)
    }

    /// Resolve the chain, reading the legacy adapter fields when the source
    /// fields are unset. Unparseable entries are skipped with a warning.
    pub fn effective_chain(&self) -> FailoverChain {
        let primary = if !self.primary_source.is_empty() {
            Some(self.primary_source.clone())
        } else if !self.primary.is_empty() {
            Some(format!("adapter:{}", self.primary))
        } else {
            None
        };
        let fallbacks: Vec<String> = if !self.fallback_sources.is_empty() {
            self.fallback_sources.clone()
        } else {
            self.fallbacks.iter().map(|id| format!("adapter:{id}")).collect()
        };

        let parse = |raw: &str| match SourceRef::parse(raw) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!(target: "clawdeck::search", entry = %raw, error = %e, "ignoring invalid stored search source");
                None
            }
        };
        let primary = primary.as_deref().and_then(parse);
        let mut chain = FailoverChain {
            primary,
            fallbacks: Vec::new(),
        };
        for source in fallbacks.iter().filter_map(|raw| parse(raw)) {
            if Some(&source) != chain.primary.as_ref() && !chain.fallbacks.contains(&source) {
                chain.fallbacks.push(source);
            }
        }
        chain
    }
}

/// Handle on the adapter file.
pub struct SearchSettings {
    file: JsonFile,
}

fn default_file_value() -> Value {
    SearchAdapterFile::defaults().to_value()
}

impl SearchSettings {
    pub fn new(file: JsonFile) -> Self {
        Self { file }
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// Load the adapter file. A missing or unreadable file is rewritten with defaults.
    pub fn load(&self) -> ReconcileResult<SearchAdapterFile> {
        match self.file.load() {
            Ok(Some(raw)) if raw.is_object() => Ok(SearchAdapterFile::from_value(&raw)),
            Ok(Some(_)) | Err(ReconcileError::Json { .. }) => {
                warn!(target: "clawdeck::search", path = %self.file.path().display(), "adapter file unreadable; rewriting defaults");
                let defaults = SearchAdapterFile::defaults();
                self.file.replace(&defaults.to_value())?;
                Ok(defaults)
            }
            Ok(None) => {
                let defaults = SearchAdapterFile::defaults();
                self.file.replace(&defaults.to_value())?;
                Ok(defaults)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`load`](Self::load) but never writes; used for read-only views.
    pub fn peek(&self) -> ReconcileResult<SearchAdapterFile> {
        match self.file.load() {
            Ok(Some(raw)) if raw.is_object() => Ok(SearchAdapterFile::from_value(&raw)),
            Ok(_) | Err(ReconcileError::Json { .. }) => Ok(SearchAdapterFile::defaults()),
            Err(e) => Err(e),
        }
    }

    fn edit<T>(&self, f: impl FnOnce(&mut SearchAdapterFile) -> ReconcileResult<T>) -> ReconcileResult<T> {
        self.file.update(default_file_value, |raw| {
            let mut parsed = if raw.is_object() {
                SearchAdapterFile::from_value(raw)
            } else {
                SearchAdapterFile::defaults()
            };
            let output = f(&mut parsed)?;
            *raw = parsed.to_value();
            Ok(output)
        })
    }

    /// Persist a validated chain. Legacy adapter fields mirror the adapter part.
    pub fn set_failover_chain<S: AsRef<str>>(
        &self,
        primary: Option<&str>,
        fallbacks: &[S],
    ) -> ReconcileResult<FailoverChain> {
        let chain = FailoverChain::parse(primary, fallbacks)?;
        self.edit(|file| {
            let primary = chain.primary.as_ref().map(ToString::to_string).unwrap_or_default();
            file.primary_source = primary.clone();
            file.active_source = primary;
            let legacy = match &chain.primary {
                Some(SourceRef::Adapter(id)) => id.clone(),
                _ => String::new(),
            };
            file.primary = legacy.clone();
            file.active = legacy;
            file.fallback_sources = chain.fallbacks.iter().map(ToString::to_string).collect();
            file.fallbacks = chain
                .fallbacks
                .iter()
                .filter(|s| s.is_adapter())
                .map(|s| s.id().to_string())
                .collect();
            Ok(())
        })?;
        info!(
            target: "clawdeck::search",
            primary = %chain.primary.as_ref().map(ToString::to_string).unwrap_or_default(),
            fallbacks = chain.fallbacks.len(),
            "search failover chain saved"
        );
        Ok(chain)
    }

    pub fn update_adapter(&self, id: &str, patch: &AdapterPatch) -> ReconcileResult<AdapterSettings> {
        let spec = adapter_spec(id).ok_or_else(|| {
            ReconcileError::validation("adapter", format!("unknown search adapter `{id}`"))
        })?;
        if let Some(url) = patch.base_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ReconcileError::validation("baseUrl", format!("`{url}` is not an http(s) URL")));
            }
        }
        let updated = self.edit(|file| {
            let slot = file
                .providers
                .iter_mut()
                .find(|(pid, _)| pid == spec.id)
                .map(|(_, s)| s)
                .ok_or_else(|| ReconcileError::validation("adapter", format!("unknown search adapter `{id}`")))?;
            if let Some(enabled) = patch.enabled {
                slot.enabled = enabled;
            }
            if let Some(key) = &patch.api_key {
                slot.api_key = key.trim().to_string();
            }
            if let Some(url) = &patch.base_url {
                // An empty URL keeps the current one.
                if !url.trim().is_empty() {
                    slot.base_url = url.trim().to_string();
                }
            }
            if let Some(model) = &patch.model {
                slot.model = model.trim().to_string();
            }
            if let Some(top_k) = patch.top_k {
                slot.top_k = clamp(top_k, TOP_K_RANGE);
            }
            if let Some(cooldown) = patch.cooldown_seconds {
                slot.cooldown_seconds = clamp(cooldown, COOLDOWN_RANGE);
            }
            Ok(slot.clone())
        })?;
        info!(target: "clawdeck::search", adapter = spec.id, enabled = updated.enabled, "search adapter updated");
        Ok(updated)
    }

    pub fn effective_chain(&self) -> ReconcileResult<FailoverChain> {
        Ok(self.peek()?.effective_chain())
    }
}

// ---------------------------------------------------------------------------
// Official search (`tools.web.search` in the primary file)
// ---------------------------------------------------------------------------

/// What `tools.web.search` currently configures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfficialSearchState {
    pub default_provider: Option<String>,
    /// Official sources with a non-empty key.
    pub configured: Vec<String>,
}

fn official_id(raw: &str) -> ReconcileResult<String> {
    let id = raw.trim().to_ascii_lowercase();
    if is_official_source(&id) {
        Ok(id)
    } else {
        Err(ReconcileError::validation(
            "provider",
            format!("`{raw}` is not an official search source ({})", OFFICIAL_SOURCES.join(", ")),
        ))
    }
}

/// Brave keeps its key at the top of the section; the others nest under their id.
fn official_key(section: &Map<String, Value>, id: &str) -> Option<String> {
    let value = if id == "brave" {
        section.get("apiKey")
    } else {
        section.get(id).and_then(|s| s.get("apiKey"))
    };
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

pub fn official_search_state(root: &Value) -> OfficialSearchState {
    let section = layout::object_at(root, layout::WEB_SEARCH);
    let default_provider = section
        .and_then(|s| s.get("provider"))
        .and_then(Value::as_str)
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty());
    let configured = section
        .map(|s| {
            OFFICIAL_SOURCES
                .iter()
                .filter(|id| official_key(s, id).is_some())
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default();
    OfficialSearchState {
        default_provider,
        configured,
    }
}

pub struct OfficialSearch {
    store: Arc<ConfigStore>,
}

impl OfficialSearch {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn state(&self) -> ReconcileResult<OfficialSearchState> {
        Ok(official_search_state(self.store.read()?.root()))
    }

    /// Store an official search key and optionally make it the default provider.
    pub fn set(&self, provider: &str, api_key: Option<&str>, make_default: bool) -> ReconcileResult<MutationReceipt> {
        let id = official_id(provider)?;
        let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());
        let receipt = self.store.mutate(&format!("set official search {id}"), |root| {
            let section = layout::object_at_mut(root, layout::WEB_SEARCH)?;
            if let Some(key) = api_key {
                if id == "brave" {
                    section.insert("apiKey".to_string(), Value::String(key.to_string()));
                } else {
                    let entry = section
                        .entry(id.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    let entry = entry.as_object_mut().ok_or_else(|| {
                        ReconcileError::validation(format!("tools.web.search.{id}"), "expected an object")
                    })?;
                    entry.insert("apiKey".to_string(), Value::String(key.to_string()));
                }
            }
            if make_default {
                section.insert("provider".to_string(), Value::String(id.clone()));
            }
            Ok(())
        })?;

        let state = official_search_state(receipt.snapshot.root());
        if api_key.is_some() && !state.configured.contains(&id) {
            return Err(ReconcileError::read_back(
                format!("official:{id}"),
                "search key not present after write",
            ));
        }
        info!(target: "clawdeck::search", provider = %id, default = make_default, "official search configured");
        Ok(receipt)
    }

    /// Remove an official source's key. Clearing an unset key is a no-op.
    pub fn clear(&self, provider: &str) -> ReconcileResult<MutationReceipt> {
        let id = official_id(provider)?;
        let receipt = self.store.mutate(&format!("clear official search {id}"), |root| {
            if id == "brave" {
                layout::remove_at(root, layout::WEB_SEARCH, "apiKey");
                return Ok(());
            }
            let mut path: Vec<&str> = layout::WEB_SEARCH.to_vec();
            path.push(&id);
            layout::remove_at(root, &path, "apiKey");
            let emptied = layout::object_at(root, &path).map(Map::is_empty).unwrap_or(false);
            if emptied {
                layout::remove_at(root, layout::WEB_SEARCH, &id);
            }
            Ok(())
        })?;
        info!(target: "clawdeck::search", provider = %id, changed = receipt.changed, "official search key cleared");
        Ok(receipt)
    }
}
