//! Integration test: model activation through the control plane.
//!
//! Verifies that:
//! 1. Quote-corrupted input is stored canonically.
//! 2. The active set equals a replay of the operations that succeeded.
//! 3. Batch calls report per key and never stop early.
//! 4. Active keys are annotated against the live catalog, or marked unknown
//!    when only the cache answers.

mod common;

use std::collections::BTreeSet;

use clawdeck_core::{normalize_key, Availability, ErrorKind, ModelKey};
use common::{write_json, Sandbox};
use serde_json::json;

#[test]
fn quote_corrupted_activation_is_stored_canonically() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let change = plane.activate("'providerB/modelY'").unwrap();
    assert_eq!(change.key.as_str(), "providerb/modelY");
    assert!(change.changed);

    let stored = sandbox.config();
    let models = stored["agents"]["defaults"]["models"].as_object().unwrap();
    assert_eq!(models.keys().collect::<Vec<_>>(), vec!["providerb/modelY"]);
    assert!(!String::from_utf8(sandbox.config_bytes()).unwrap().contains("'providerB"));

    // Same key again is a no-op and writes nothing.
    let again = plane.activate("\"ProviderB/modelY\"").unwrap();
    assert!(!again.changed);
    assert!(again.backup.is_none());
}

#[test]
fn active_set_matches_replay_of_successful_operations() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let ops: [(bool, &str); 9] = [
        (true, "openai/gpt-4o"),
        (true, "'groq/llama-3.1'"),
        (true, ""),
        (false, "openai/gpt-4o"),
        (true, "Mistral/large"),
        (false, "never/active"),
        (true, "openai/"),
        (true, "OPENAI/gpt-4o"),
        (false, "\"groq/llama-3.1\""),
    ];

    let mut expected: BTreeSet<ModelKey> = BTreeSet::new();
    for (activate, raw) in ops {
        let result = if activate { plane.activate(raw) } else { plane.deactivate(raw) };
        if let Ok(change) = result {
            if activate {
                expected.insert(change.key);
            } else {
                expected.remove(&change.key);
            }
        }
    }

    let state = plane.state().unwrap();
    let actual: BTreeSet<ModelKey> = state.active_models.into_iter().collect();
    assert_eq!(actual, expected);
    assert_eq!(
        actual,
        ["openai/gpt-4o", "mistral/large"].iter().map(|k| normalize_key(k).unwrap()).collect()
    );
}

#[test]
fn batch_reports_each_key() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let outcomes = plane.activate_many(&["openai/gpt-4o", "''", "groq/llama"]);
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].ok && outcomes[0].changed);
    assert!(!outcomes[1].ok);
    assert_eq!(outcomes[1].error_kind, Some(ErrorKind::Validation));
    assert!(outcomes[1].key.is_none());
    assert!(outcomes[2].ok);

    let outcomes = plane.deactivate_many(&["groq/llama", "groq/llama"]);
    assert!(outcomes[0].changed);
    assert!(outcomes[1].ok && !outcomes[1].changed);
}

#[test]
fn activation_preserves_unrelated_settings() {
    let sandbox = Sandbox::new();
    sandbox.write_config(&json!({
        "gateway": { "port": 18789 },
        "agents": { "defaults": { "models": { "openai/gpt-4o": { "alias": "main" } } } }
    }));
    let plane = sandbox.open(sandbox.runtime());

    plane.activate("anthropic/claude-3").unwrap();
    let stored = sandbox.config();
    assert_eq!(stored["gateway"]["port"], json!(18789));
    assert_eq!(stored["agents"]["defaults"]["models"]["openai/gpt-4o"]["alias"], json!("main"));
    assert_eq!(plane.list_backups(None).unwrap().len(), 1);
}

#[tokio::test]
async fn active_models_are_annotated_from_live_catalog() {
    let sandbox = Sandbox::new();
    sandbox.write_config(&json!({
        "agents": { "defaults": { "models": { "openai/gpt-4o": {}, "openai/retired": {}, "groq/llama": {} } } }
    }));
    let plane = sandbox.open(sandbox.runtime().with_catalog("openai", &["gpt-4o", "openai/gpt-4.1"]));

    let annotated = plane.active_models("OpenAI").await.unwrap();
    assert_eq!(annotated.len(), 2);
    let by_key = |k: &str| annotated.iter().find(|m| m.key.as_str() == k).unwrap().availability;
    assert_eq!(by_key("openai/gpt-4o"), Availability::Available);
    assert_eq!(by_key("openai/retired"), Availability::Unavailable);
}

#[tokio::test]
async fn cache_fallback_is_marked_unknown() {
    let sandbox = Sandbox::new();
    sandbox.write_config(&json!({
        "agents": { "defaults": { "models": { "openai/gpt-4o": {}, "openai/retired": {} } } }
    }));
    write_json(
        &sandbox.settings.models_cache_path,
        &json!({ "providers": { "openai": { "models": [{ "id": "gpt-4o", "name": "GPT-4o" }] } } }),
    );
    let mut runtime = sandbox.runtime();
    runtime.offline = true;
    let plane = sandbox.open(runtime);

    let report = plane.catalog("openai").await.unwrap();
    assert!(report.is_stale());
    assert_eq!(report.source.as_deref(), Some("models-cache"));
    assert_eq!(report.skipped.len(), 1);

    let annotated = plane.active_models("openai").await.unwrap();
    assert!(annotated.iter().all(|m| m.availability == Availability::Unknown));
}
