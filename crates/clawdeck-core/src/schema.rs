//! Structural constraints checked before any write reaches disk.
//!
//! [`validate_changes`] rejects a proposed tree with the first violated
//! constraint, judging only what the write changed. Model keys and policies
//! are checked per section; agents, providers and profiles per entry, so
//! entries carried over untouched from the stored tree are not re-checked.
//! [`scan_corruption`] is the softer read-side check: it reports every stored
//! key that breaks the normalization invariant without failing the read.
//!
//! Provider entry contents beyond the id and the `models` shape belong to the
//! runtime and are not checked here.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::{ReconcileError, ReconcileResult};
use crate::layout::{self, dotted};
use crate::normalize::{is_canonical, normalize_provider};

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ReconcileError {
    ReconcileError::validation(field, reason)
}

/// Validate a whole tree as if every section were new.
pub fn validate(root: &Value) -> ReconcileResult<()> {
    validate_changes(&Value::Object(Map::new()), root)
}

/// Validate the sections and entries of `next` that differ from `previous`.
pub fn validate_changes(previous: &Value, next: &Value) -> ReconcileResult<()> {
    if !next.is_object() {
        return Err(invalid("$", "configuration root must be an object"));
    }
    validate_active_models(previous, next)?;
    validate_policies(previous, next)?;
    validate_agents(previous, next)?;
    validate_providers(previous, next)?;
    validate_profiles(previous, next)?;
    Ok(())
}

fn unchanged(previous: &Value, next: &Value, path: &[&str]) -> bool {
    layout::value_at(previous, path) == layout::value_at(next, path)
}

fn section<'a>(root: &'a Value, path: &[&str]) -> ReconcileResult<Option<&'a Map<String, Value>>> {
    match layout::value_at(root, path) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(invalid(dotted(path), "expected an object")),
    }
}

/// Whether `key` maps to the same value in both sections.
fn carried_over(before: Option<&Map<String, Value>>, key: &str, value: &Value) -> bool {
    before.and_then(|b| b.get(key)) == Some(value)
}

fn validate_active_models(previous: &Value, next: &Value) -> ReconcileResult<()> {
    if unchanged(previous, next, layout::ACTIVE_MODELS) {
        return Ok(());
    }
    let Some(models) = section(next, layout::ACTIVE_MODELS)? else {
        return Ok(());
    };
    for key in models.keys() {
        if !is_canonical(key) {
            return Err(invalid(
                dotted(layout::ACTIVE_MODELS),
                format!("model key `{key}` is not canonical; run self-heal"),
            ));
        }
    }
    Ok(())
}

fn validate_policy(field: &str, value: &Value) -> ReconcileResult<()> {
    match value {
        Value::String(primary) => {
            if !is_canonical(primary) {
                return Err(invalid(field, format!("primary `{primary}` is not canonical")));
            }
        }
        Value::Object(policy) => {
            if let Some(primary) = policy.get("primary") {
                let primary = primary
                    .as_str()
                    .ok_or_else(|| invalid(format!("{field}.primary"), "expected a string"))?;
                if !primary.is_empty() && !is_canonical(primary) {
                    return Err(invalid(
                        format!("{field}.primary"),
                        format!("`{primary}` is not canonical"),
                    ));
                }
            }
            if let Some(fallbacks) = policy.get("fallbacks") {
                let fallbacks = fallbacks
                    .as_array()
                    .ok_or_else(|| invalid(format!("{field}.fallbacks"), "expected an array"))?;
                let mut seen = HashSet::new();
                for entry in fallbacks {
                    let key = entry.as_str().ok_or_else(|| {
                        invalid(format!("{field}.fallbacks"), "entries must be strings")
                    })?;
                    if !is_canonical(key) {
                        return Err(invalid(
                            format!("{field}.fallbacks"),
                            format!("`{key}` is not canonical"),
                        ));
                    }
                    if !seen.insert(key) {
                        return Err(invalid(
                            format!("{field}.fallbacks"),
                            format!("`{key}` is listed twice"),
                        ));
                    }
                }
            }
        }
        _ => return Err(invalid(field, "expected a policy object")),
    }
    Ok(())
}

fn validate_policies(previous: &Value, next: &Value) -> ReconcileResult<()> {
    const GLOBAL: &[&str] = &["agents", "defaults", "model"];
    const SPAWN: &[&str] = &["agents", "defaults", "subagents", "model"];
    const CONCURRENCY: &[&str] = &["agents", "defaults", "subagents", "maxConcurrent"];

    for path in [GLOBAL, SPAWN] {
        if unchanged(previous, next, path) {
            continue;
        }
        if let Some(policy) = layout::value_at(next, path) {
            validate_policy(&dotted(path), policy)?;
        }
    }
    if !unchanged(previous, next, CONCURRENCY) {
        if let Some(subagents) = section(next, layout::SUBAGENT_DEFAULTS)? {
            if subagents.contains_key("maxConcurrent")
                && layout::positive_u32(subagents, "maxConcurrent").is_none()
            {
                return Err(invalid(dotted(CONCURRENCY), "must be a positive integer"));
            }
        }
    }
    Ok(())
}

fn validate_agent(field: &str, agent: &Map<String, Value>) -> ReconcileResult<()> {
    if let Some(policy) = agent.get(layout::MODEL_FIELD) {
        validate_policy(&format!("{field}.model"), policy)?;
    }
    let Some(subagents) = agent.get("subagents") else {
        return Ok(());
    };
    let subagents = subagents
        .as_object()
        .ok_or_else(|| invalid(format!("{field}.subagents"), "expected an object"))?;
    if let Some(allow) = subagents.get("allowAgents") {
        let all_strings = allow
            .as_array()
            .map(|a| a.iter().all(Value::is_string))
            .unwrap_or(false);
        if !all_strings {
            return Err(invalid(
                format!("{field}.subagents.allowAgents"),
                "expected an array of agent ids",
            ));
        }
    }
    if subagents.contains_key("maxConcurrent")
        && layout::positive_u32(subagents, "maxConcurrent").is_none()
    {
        return Err(invalid(
            format!("{field}.subagents.maxConcurrent"),
            "must be a positive integer",
        ));
    }
    if let Some(policy) = subagents.get(layout::MODEL_FIELD) {
        validate_policy(&format!("{field}.subagents.model"), policy)?;
    }
    Ok(())
}

fn validate_agents(previous: &Value, next: &Value) -> ReconcileResult<()> {
    let path = [layout::AGENTS, layout::AGENT_LIST];
    if unchanged(previous, next, &path) {
        return Ok(());
    }
    let Some(list) = layout::value_at(next, &path) else {
        return Ok(());
    };
    let list = list
        .as_array()
        .ok_or_else(|| invalid("agents.list", "expected an array"))?;

    let before = layout::agent_list(previous);
    let (kept, touched): (Vec<_>, Vec<_>) = list
        .iter()
        .enumerate()
        .partition(|(_, entry)| before.contains(entry));
    let mut ids: HashSet<&str> = kept.iter().filter_map(|(_, entry)| layout::agent_id(entry)).collect();

    for (index, entry) in touched {
        let field = format!("agents.list[{index}]");
        let agent = entry
            .as_object()
            .ok_or_else(|| invalid(&field, "expected an object"))?;
        let id = agent
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid(format!("{field}.id"), "agent id is required"))?;
        if !ids.insert(id) {
            return Err(invalid(format!("{field}.id"), format!("duplicate agent id `{id}`")));
        }
        validate_agent(&field, agent)?;
    }
    Ok(())
}

fn validate_providers(previous: &Value, next: &Value) -> ReconcileResult<()> {
    if unchanged(previous, next, layout::PROVIDERS) {
        return Ok(());
    }
    let Some(providers) = section(next, layout::PROVIDERS)? else {
        return Ok(());
    };
    let before = layout::object_at(previous, layout::PROVIDERS);
    for (id, entry) in providers {
        if carried_over(before, id, entry) {
            continue;
        }
        let field = format!("models.providers.{id}");
        if normalize_provider(id).as_deref() != Some(id.as_str()) {
            return Err(invalid(&field, "provider id is not normalized"));
        }
        let entry = entry
            .as_object()
            .ok_or_else(|| invalid(&field, "expected an object"))?;
        if let Some(models) = entry.get("models") {
            if !models.is_array() {
                return Err(invalid(format!("{field}.models"), "expected an array"));
            }
        }
    }
    Ok(())
}

fn validate_profiles(previous: &Value, next: &Value) -> ReconcileResult<()> {
    if unchanged(previous, next, layout::AUTH_PROFILES) {
        return Ok(());
    }
    let Some(profiles) = section(next, layout::AUTH_PROFILES)? else {
        return Ok(());
    };
    let before = layout::object_at(previous, layout::AUTH_PROFILES);
    for (id, profile) in profiles {
        if carried_over(before, id, profile) {
            continue;
        }
        let field = format!("auth.profiles.{id}");
        let provider = profile
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(&field, "profile must name a provider"))?;
        if normalize_provider(provider).as_deref() != Some(provider) {
            return Err(invalid(
                format!("{field}.provider"),
                format!("provider `{provider}` is not normalized"),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read-side corruption scan
// ---------------------------------------------------------------------------

fn scan_policy(field: &str, value: &Value, out: &mut Vec<ReconcileError>) {
    let mut check = |key: &str| {
        if !key.is_empty() && !is_canonical(key) {
            out.push(ReconcileError::Corruption {
                key: key.to_string(),
                reason: format!("non-canonical key in {field}"),
            });
        }
    };
    match value {
        Value::String(primary) => check(primary),
        Value::Object(policy) => {
            if let Some(primary) = policy.get("primary").and_then(Value::as_str) {
                check(primary);
            }
            for key in policy
                .get("fallbacks")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                check(key);
            }
        }
        _ => {}
    }
}

/// Collect every stored model key or provider name that is not canonical.
pub fn scan_corruption(root: &Value) -> Vec<ReconcileError> {
    let mut out = Vec::new();

    if let Some(models) = layout::object_at(root, layout::ACTIVE_MODELS) {
        for key in models.keys().filter(|key| !is_canonical(key)) {
            out.push(ReconcileError::Corruption {
                key: key.clone(),
                reason: "non-canonical key in agents.defaults.models".to_string(),
            });
        }
    }
    if let Some(policy) = layout::value_at(root, &["agents", "defaults", "model"]) {
        scan_policy("agents.defaults.model", policy, &mut out);
    }
    if let Some(policy) = layout::value_at(root, &["agents", "defaults", "subagents", "model"]) {
        scan_policy("agents.defaults.subagents.model", policy, &mut out);
    }
    for agent in layout::agent_list(root) {
        let id = layout::agent_id(agent).unwrap_or("?");
        if let Some(policy) = agent.get(layout::MODEL_FIELD) {
            scan_policy(&format!("agent {id}"), policy, &mut out);
        }
        if let Some(policy) = agent.get("subagents").and_then(|s| s.get(layout::MODEL_FIELD)) {
            scan_policy(&format!("agent {id} subagents"), policy, &mut out);
        }
    }
    if let Some(profiles) = layout::object_at(root, layout::AUTH_PROFILES) {
        for (id, profile) in profiles {
            if let Some(provider) = profile.get("provider").and_then(Value::as_str) {
                if normalize_provider(provider).as_deref() != Some(provider) {
                    out.push(ReconcileError::Corruption {
                        key: provider.to_string(),
                        reason: format!("non-normalized provider on profile {id}"),
                    });
                }
            }
        }
    }
    out
}
