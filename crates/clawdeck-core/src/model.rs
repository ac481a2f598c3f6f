//! Data model shared by the reconciliation components.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ReconcileError, ReconcileResult};
use crate::normalize::{normalize_key, ModelKey};

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    Custom,
}

/// Wire protocols a custom provider may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "openai-chat")]
    OpenAiChat,
    #[serde(rename = "openai-completions")]
    OpenAiCompletions,
    #[serde(rename = "anthropic-messages")]
    AnthropicMessages,
    #[serde(rename = "anthropic-completions")]
    AnthropicCompletions,
    #[serde(rename = "gemini-v1beta")]
    GeminiV1Beta,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::OpenAiChat,
        Protocol::OpenAiCompletions,
        Protocol::AnthropicMessages,
        Protocol::AnthropicCompletions,
        Protocol::GeminiV1Beta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::OpenAiChat => "openai-chat",
            Protocol::OpenAiCompletions => "openai-completions",
            Protocol::AnthropicMessages => "anthropic-messages",
            Protocol::AnthropicCompletions => "anthropic-completions",
            Protocol::GeminiV1Beta => "gemini-v1beta",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Protocol::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = Protocol::ALL.iter().map(|p| p.as_str()).collect();
                ReconcileError::validation(
                    "api",
                    format!("unknown protocol `{s}` (expected one of {})", known.join(", ")),
                )
            })
    }
}

/// A provider as seen across the primary config, both credential stores and
/// the active model set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub auth: AuthMethod,
    pub base_url: Option<String>,
    /// Raw `api` tag from `models.providers`; official providers may use tags
    /// outside [`Protocol::ALL`].
    pub protocol: Option<String>,
    pub active_models: usize,
    pub profiles: usize,
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRecord {
    pub key: ModelKey,
    pub name: String,
    pub availability: Availability,
}

// ---------------------------------------------------------------------------
// Auth profiles
// ---------------------------------------------------------------------------

/// Which store a profile observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    /// `auth.profiles` in the primary configuration file.
    Config,
    /// The runtime's `auth-profiles.json` store.
    AuthStore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub label: String,
    /// `mode` or `type` as recorded by whichever store wrote it last.
    pub kind: Option<String>,
    pub sources: Vec<ProfileSource>,
    /// Attribute names on which the stores disagreed.
    pub conflicts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Model policy
// ---------------------------------------------------------------------------

/// `{ primary, fallbacks }` at one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPolicy {
    pub primary: Option<ModelKey>,
    pub fallbacks: Vec<ModelKey>,
}

impl ModelPolicy {
    /// Normalize raw input: canonical keys, fallbacks de-duplicated in order,
    /// the primary never repeated as a fallback.
    pub fn from_raw<S: AsRef<str>>(primary: Option<&str>, fallbacks: &[S]) -> ReconcileResult<Self> {
        let primary = match primary.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => Some(normalize_key(raw)?),
            None => None,
        };
        let mut out: Vec<ModelKey> = Vec::new();
        for raw in fallbacks {
            let key = normalize_key(raw.as_ref())?;
            if Some(&key) != primary.as_ref() && !out.contains(&key) {
                out.push(key);
            }
        }
        Ok(Self {
            primary,
            fallbacks: out,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.fallbacks.is_empty()
    }

    /// Parse a persisted policy. Accepts the object form and the legacy
    /// string form (`"model": "provider/name"`).
    pub fn from_value(value: &Value) -> ReconcileResult<Self> {
        match value {
            Value::String(primary) => Self::from_raw::<&str>(Some(primary.as_str()), &[]),
            Value::Object(map) => {
                let primary = map.get("primary").and_then(Value::as_str);
                let fallbacks: Vec<&str> = map
                    .get("fallbacks")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Self::from_raw(primary, &fallbacks)
            }
            Value::Null => Ok(Self::default()),
            _ => Err(ReconcileError::validation("model", "expected a policy object")),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "primary": self.primary.as_ref().map(ModelKey::as_str).unwrap_or(""),
            "fallbacks": self.fallbacks.iter().map(ModelKey::as_str).collect::<Vec<_>>(),
        })
    }

    /// Every key the policy references, primary first.
    pub fn keys(&self) -> impl Iterator<Item = &ModelKey> {
        self.primary.iter().chain(self.fallbacks.iter())
    }
}

// ---------------------------------------------------------------------------
// Dispatch policy
// ---------------------------------------------------------------------------

pub const WILDCARD: &str = "*";

/// Which agents may be spawned as sub-agents. Persisted as `["*"]` or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowAgents {
    Wildcard,
    Only(Vec<String>),
}

impl AllowAgents {
    pub fn from_ids<S: AsRef<str>>(ids: &[S]) -> Self {
        let mut out: Vec<String> = Vec::new();
        for raw in ids {
            let id = raw.as_ref().trim().trim_matches(['\'', '"']).trim();
            if id == WILDCARD {
                return AllowAgents::Wildcard;
            }
            if !id.is_empty() && !out.iter().any(|existing| existing == id) {
                out.push(id.to_string());
            }
        }
        AllowAgents::Only(out)
    }

    pub fn from_value(value: Option<&Value>) -> Self {
        let ids: Vec<&str> = value
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        Self::from_ids(&ids)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AllowAgents::Only(ids) if ids.is_empty())
    }

    pub fn to_value(&self) -> Value {
        match self {
            AllowAgents::Wildcard => json!([WILDCARD]),
            AllowAgents::Only(ids) => json!(ids),
        }
    }
}

impl Serialize for AllowAgents {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Where an effective `maxConcurrent` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencySource {
    Agent,
    Global,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPolicy {
    pub agent_id: String,
    pub enabled: bool,
    pub allow_agents: AllowAgents,
    /// Per-agent override, if any.
    pub max_concurrent_override: Option<u32>,
    /// Value in effect after inheritance.
    pub max_concurrent: u32,
    pub max_concurrent_source: ConcurrencySource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_raw_normalizes() {
        let policy = ModelPolicy::from_raw(
            Some("'OpenAI/gpt-4o'"),
            &["groq/llama", "\"groq/llama\"", "openai/gpt-4o", "Mistral/large"],
        )
        .unwrap();
        assert_eq!(policy.primary.as_ref().unwrap().as_str(), "openai/gpt-4o");
        let fallbacks: Vec<&str> = policy.fallbacks.iter().map(ModelKey::as_str).collect();
        assert_eq!(fallbacks, vec!["groq/llama", "mistral/large"]);
    }

    #[test]
    fn test_policy_legacy_string_form() {
        let policy = ModelPolicy::from_value(&json!("anthropic/claude-3")).unwrap();
        assert_eq!(policy.primary.unwrap().as_str(), "anthropic/claude-3");
        assert!(policy.fallbacks.is_empty());
    }

    #[test]
    fn test_policy_value_shape() {
        let policy = ModelPolicy::from_raw(Some("a/b"), &["c/d"]).unwrap();
        assert_eq!(policy.to_value(), json!({ "primary": "a/b", "fallbacks": ["c/d"] }));
        assert_eq!(ModelPolicy::from_value(&policy.to_value()).unwrap(), policy);
        assert!(ModelPolicy::from_raw::<&str>(Some("  "), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("Anthropic-Messages".parse::<Protocol>().unwrap(), Protocol::AnthropicMessages);
        assert!("grpc".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_allow_agents() {
        assert_eq!(AllowAgents::from_ids(&["a", "*", "b"]), AllowAgents::Wildcard);
        assert_eq!(
            AllowAgents::from_ids(&["'a'", "a", " ", "b"]),
            AllowAgents::Only(vec!["a".into(), "b".into()])
        );
        assert!(AllowAgents::from_value(None).is_empty());
        assert_eq!(AllowAgents::Wildcard.to_value(), json!(["*"]));
    }
}
