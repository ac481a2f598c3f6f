//! Paths into the runtime's configuration tree.
//!
//! The primary file belongs to the runtime; only the sections named here are
//! read or rewritten. Everything else is carried through untouched.

use serde_json::{Map, Value};

use crate::error::{ReconcileError, ReconcileResult};

/// `agents.defaults.models`: the active model set.
pub const ACTIVE_MODELS: &[&str] = &["agents", "defaults", "models"];
/// `agents.defaults`: holds the global `model` policy.
pub const AGENT_DEFAULTS: &[&str] = &["agents", "defaults"];
/// `agents.defaults.subagents`: holds the spawn `model` policy and `maxConcurrent`.
pub const SUBAGENT_DEFAULTS: &[&str] = &["agents", "defaults", "subagents"];
/// `auth.profiles`
pub const AUTH_PROFILES: &[&str] = &["auth", "profiles"];
/// `models.providers`
pub const PROVIDERS: &[&str] = &["models", "providers"];
/// `tools.web.search`
pub const WEB_SEARCH: &[&str] = &["tools", "web", "search"];

pub const MODEL_FIELD: &str = "model";
pub const AGENTS: &str = "agents";
pub const AGENT_LIST: &str = "list";

pub fn dotted(path: &[&str]) -> String {
    path.join(".")
}

/// Walk `path` and return the value there, if every hop exists.
pub fn value_at<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, segment| node.get(*segment))
}

pub fn object_at<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    value_at(root, path).and_then(Value::as_object)
}

/// Walk `path`, creating empty objects where a hop is missing.
///
/// A hop that exists but is not an object is a validation error; it is never
/// replaced, since that would drop data the runtime owns.
pub fn object_at_mut<'a>(
    root: &'a mut Value,
    path: &[&str],
) -> ReconcileResult<&'a mut Map<String, Value>> {
    if root.is_null() {
        *root = Value::Object(Map::new());
    }
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        let map = node.as_object_mut().ok_or_else(|| {
            ReconcileError::validation(dotted(&path[..depth]), "expected an object")
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| ReconcileError::validation(dotted(path), "expected an object"))
}

/// Remove `field` from the object at `path`. Missing hops are not an error.
pub fn remove_at(root: &mut Value, path: &[&str], field: &str) -> Option<Value> {
    let mut node = root;
    for segment in path {
        node = node.get_mut(*segment)?;
    }
    node.as_object_mut()?.remove(field)
}

// ---------------------------------------------------------------------------
// agents.list
// ---------------------------------------------------------------------------

pub fn agent_list(root: &Value) -> &[Value] {
    root.get(AGENTS)
        .and_then(|a| a.get(AGENT_LIST))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn agent_id(entry: &Value) -> Option<&str> {
    entry.get("id").and_then(Value::as_str)
}

pub fn find_agent<'a>(root: &'a Value, id: &str) -> Option<&'a Map<String, Value>> {
    agent_list(root)
        .iter()
        .find(|entry| agent_id(entry) == Some(id))
        .and_then(Value::as_object)
}

/// Find the agent entry, appending `{ "id": id }` to `agents.list` if absent.
pub fn ensure_agent<'a>(root: &'a mut Value, id: &str) -> ReconcileResult<&'a mut Map<String, Value>> {
    let agents = object_at_mut(root, &[AGENTS])?;
    let list = agents
        .entry(AGENT_LIST.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| ReconcileError::validation("agents.list", "expected an array"))?;

    let index = match list.iter().position(|entry| agent_id(entry) == Some(id)) {
        Some(index) => index,
        None => {
            let mut entry = Map::new();
            entry.insert("id".to_string(), Value::String(id.to_string()));
            list.push(Value::Object(entry));
            list.len() - 1
        }
    };
    list[index]
        .as_object_mut()
        .ok_or_else(|| ReconcileError::validation(format!("agents.list[{index}]"), "expected an object"))
}

pub fn find_agent_mut<'a>(root: &'a mut Value, id: &str) -> Option<&'a mut Map<String, Value>> {
    root.get_mut(AGENTS)?
        .get_mut(AGENT_LIST)?
        .as_array_mut()?
        .iter_mut()
        .find(|entry| agent_id(entry) == Some(id))?
        .as_object_mut()
}

/// Read a strictly positive integer field.
pub fn positive_u32(map: &Map<String, Value>, field: &str) -> Option<u32> {
    map.get(field)
        .and_then(Value::as_u64)
        .filter(|n| *n >= 1)
        .and_then(|n| u32::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_at_mut_creates_missing_hops() {
        let mut root = json!({ "meta": { "version": 3 } });
        object_at_mut(&mut root, ACTIVE_MODELS)
            .unwrap()
            .insert("openai/gpt-4o".into(), json!({}));
        assert_eq!(root["agents"]["defaults"]["models"]["openai/gpt-4o"], json!({}));
        assert_eq!(root["meta"]["version"], json!(3));
    }

    #[test]
    fn test_object_at_mut_refuses_to_clobber() {
        let mut root = json!({ "agents": { "defaults": "oops" } });
        let err = object_at_mut(&mut root, ACTIVE_MODELS).unwrap_err();
        assert!(err.to_string().contains("agents.defaults"));
        assert_eq!(root["agents"]["defaults"], json!("oops"));
    }

    #[test]
    fn test_ensure_agent_appends_once() {
        let mut root = json!({ "agents": { "list": [{ "id": "main" }] } });
        ensure_agent(&mut root, "research").unwrap();
        ensure_agent(&mut root, "research").unwrap();
        assert_eq!(agent_list(&root).len(), 2);
        assert!(find_agent(&root, "research").is_some());
        assert!(find_agent(&root, "ghost").is_none());
    }

    #[test]
    fn test_remove_at() {
        let mut root = json!({ "agents": { "defaults": { "model": "x/y" } } });
        assert_eq!(remove_at(&mut root, AGENT_DEFAULTS, MODEL_FIELD), Some(json!("x/y")));
        assert_eq!(remove_at(&mut root, &["nope", "deeper"], MODEL_FIELD), None);
    }
}
