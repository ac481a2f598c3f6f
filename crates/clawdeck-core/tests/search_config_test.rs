//! Integration test: search failover chain, adapter settings and official keys.

mod common;

use clawdeck_core::{AdapterPatch, ErrorKind, SourceRef};
use common::{read_json, Sandbox};
use serde_json::json;

#[test]
fn chain_round_trips_through_adapter_file() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let chain = plane
        .set_search_failover_chain(Some("adapter:tavily"), &["official:brave", "adapter:serper", "adapter:tavily"])
        .unwrap();
    assert_eq!(chain.primary, Some(SourceRef::Adapter("tavily".into())));
    assert_eq!(chain.fallbacks.len(), 2);
    assert_eq!(plane.search_failover_chain().unwrap(), chain);

    let stored = read_json(&sandbox.settings.search_adapters_path);
    assert_eq!(stored["primarySource"], json!("adapter:tavily"));
    assert_eq!(stored["primary"], json!("tavily"));
    assert_eq!(stored["fallbackSources"], json!(["official:brave", "adapter:serper"]));
    assert_eq!(stored["fallbacks"], json!(["serper"]));
}

#[test]
fn cleared_primary_stays_cleared_on_read_back() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    plane.set_search_failover_chain(Some("adapter:zhipu"), &["adapter:serper"]).unwrap();
    let cleared = plane.set_search_failover_chain::<&str>(None, &[]).unwrap();
    assert_eq!(cleared.primary, None);
    assert_eq!(plane.search_failover_chain().unwrap(), cleared);

    let stored = read_json(&sandbox.settings.search_adapters_path);
    assert_eq!(stored["primary"], json!(""));
    assert_eq!(stored["active"], json!(""));
    assert_eq!(plane.state().unwrap().search_chain, cleared);
}

#[test]
fn reading_the_chain_leaves_the_disk_alone() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    assert_eq!(plane.search_failover_chain().unwrap().primary, None);
    assert!(!sandbox.settings.search_adapters_path.exists());
}

#[test]
fn invalid_chain_entry_is_named_and_nothing_changes() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());
    plane.set_search_failover_chain(Some("official:brave"), &["adapter:serper"]).unwrap();
    let before = std::fs::read(&sandbox.settings.search_adapters_path).unwrap();

    let failure = plane
        .set_search_failover_chain(Some("official:brave"), &["adapter:serper", "web:duck"])
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(failure.reason.contains("web:duck"));
    assert_eq!(std::fs::read(&sandbox.settings.search_adapters_path).unwrap(), before);
}

#[test]
fn legacy_adapter_fields_resolve_into_chain() {
    let sandbox = Sandbox::new();
    common::write_json(
        &sandbox.settings.search_adapters_path,
        &json!({ "active": "Serper", "fallbacks": ["zhipu", "unknown"] }),
    );
    let plane = sandbox.open(sandbox.runtime());

    let chain = plane.search_failover_chain().unwrap();
    assert_eq!(chain.primary, Some(SourceRef::Adapter("serper".into())));
    assert_eq!(chain.fallbacks, vec![SourceRef::Adapter("zhipu".into())]);
}

#[test]
fn adapter_patch_clamps_and_state_masks_keys() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let updated = plane
        .update_search_adapter(
            "tavily",
            &AdapterPatch {
                enabled: Some(true),
                api_key: Some(" tvly-0123456789 ".into()),
                top_k: Some(50),
                cooldown_seconds: Some(0),
                ..AdapterPatch::default()
            },
        )
        .unwrap();
    assert_eq!(updated.api_key, "tvly-0123456789");
    assert_eq!((updated.top_k, updated.cooldown_seconds), (20, 5));

    let failure = plane
        .update_search_adapter("tavily", &AdapterPatch { base_url: Some("ftp://x".into()), ..AdapterPatch::default() })
        .unwrap_err();
    assert_eq!(failure.field.as_deref(), Some("baseUrl"));
    assert!(plane.update_search_adapter("bing", &AdapterPatch::default()).is_err());

    let state = plane.state().unwrap();
    assert_eq!(state.search_adapters["providers"]["tavily"]["apiKey"], json!("****6789"));
    assert_eq!(state.search_adapters["providers"]["tavily"]["enabled"], json!(true));
}

#[test]
fn official_search_keys_live_in_primary_config() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    plane.set_official_search("Brave", Some("bsa-key"), true).unwrap();
    plane.set_official_search("perplexity", Some("pplx-key"), false).unwrap();
    let stored = sandbox.config();
    assert_eq!(stored["tools"]["web"]["search"]["apiKey"], json!("bsa-key"));
    assert_eq!(stored["tools"]["web"]["search"]["perplexity"]["apiKey"], json!("pplx-key"));
    assert_eq!(stored["tools"]["web"]["search"]["provider"], json!("brave"));

    let state = plane.state().unwrap().official_search;
    assert_eq!(state.default_provider.as_deref(), Some("brave"));
    assert_eq!(state.configured.len(), 2);

    plane.clear_official_search("perplexity").unwrap();
    assert!(sandbox.config()["tools"]["web"]["search"].get("perplexity").is_none());
    assert!(!plane.clear_official_search("perplexity").unwrap().changed);

    assert_eq!(plane.set_official_search("bing", Some("k"), false).unwrap_err().kind, ErrorKind::Validation);
}
