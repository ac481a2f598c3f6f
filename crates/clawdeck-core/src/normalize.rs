//! Key Normalizer
//!
//! Every model key that crosses a boundary (request input, persisted read,
//! catalog response) passes through [`normalize_key`] before it is compared
//! or written. The canonical form is `provider/name`: no quote characters,
//! provider segment trimmed and lower-cased, name segment trimmed but
//! otherwise untouched (it may contain further `/`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};

/// Provider used when a raw key carries no `/` separator.
pub const OTHER_PROVIDER: &str = "other";

const QUOTES: [char; 2] = ['\'', '"'];

/// A model key in canonical `provider/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelKey(String);

impl ModelKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provider(&self) -> &str {
        self.0.split_once('/').map(|(p, _)| p).unwrap_or(OTHER_PROVIDER)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    pub fn belongs_to(&self, provider: &str) -> bool {
        self.provider() == provider
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ModelKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ModelKey {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_key(s)
    }
}

impl TryFrom<String> for ModelKey {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize_key(&value)
    }
}

impl From<ModelKey> for String {
    fn from(key: ModelKey) -> Self {
        key.0
    }
}

fn strip_quotes(raw: &str) -> String {
    raw.chars().filter(|c| !QUOTES.contains(c)).collect()
}

/// Canonicalize a raw model key.
///
/// Quote characters are removed wherever they appear, so `"'openai/gpt-4o'"`
/// and `'"openai"/gpt-4o'` both become `openai/gpt-4o`.
pub fn normalize_key(raw: &str) -> ReconcileResult<ModelKey> {
    let cleaned = strip_quotes(raw);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(ReconcileError::validation("model", "model key is empty"));
    }

    let (provider, name) = match cleaned.split_once('/') {
        Some((provider, name)) => (provider.trim().to_lowercase(), name.trim()),
        None => (String::new(), cleaned),
    };
    if name.is_empty() {
        return Err(ReconcileError::validation(
            "model",
            format!("model key `{raw}` has no model name"),
        ));
    }
    let provider = if provider.is_empty() {
        OTHER_PROVIDER.to_string()
    } else {
        provider
    };

    Ok(ModelKey(format!("{provider}/{name}")))
}

/// Canonicalize a bare provider id. Returns `None` when nothing is left.
pub fn normalize_provider(raw: &str) -> Option<String> {
    let cleaned = strip_quotes(raw).trim().to_lowercase();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Provider id used for grouping and display; never empty.
pub fn provider_label(raw: &str) -> String {
    normalize_provider(raw).unwrap_or_else(|| OTHER_PROVIDER.to_string())
}

/// Whether a stored key is already in canonical form.
pub fn is_canonical(raw: &str) -> bool {
    normalize_key(raw)
        .map(|key| key.as_str() == raw)
        .unwrap_or(false)
}

/// Agent ids are matched verbatim after quote stripping and trimming.
pub fn normalize_agent_id(raw: &str) -> ReconcileResult<String> {
    let cleaned = strip_quotes(raw).trim().to_string();
    if cleaned.is_empty() {
        return Err(ReconcileError::validation("agentId", "agent id is empty"));
    }
    if cleaned.contains(char::is_whitespace) {
        return Err(ReconcileError::validation(
            "agentId",
            format!("agent id `{cleaned}` contains whitespace"),
        ));
    }
    Ok(cleaned)
}
