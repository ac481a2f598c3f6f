//! Integration test: per-agent dispatch policy and sub-agent concurrency.
//!
//! Dispatch enabled with an empty allow list is resolved by the configured
//! default-allow rule; both rules are exercised here.

mod common;

use clawdeck_core::{AllowAgents, ConcurrencySource, DispatchDefaultAllow, DispatchRequest, ErrorKind};
use common::Sandbox;
use serde_json::json;

fn enable(allow: &[&str]) -> DispatchRequest {
    DispatchRequest {
        enabled: true,
        allow_agents: allow.iter().map(|s| s.to_string()).collect(),
        ..DispatchRequest::default()
    }
}

#[test]
fn empty_allow_list_becomes_wildcard_by_default() {
    let sandbox = Sandbox::new();
    assert_eq!(sandbox.settings.dispatch_default_allow, DispatchDefaultAllow::Wildcard);
    let plane = sandbox.open(sandbox.runtime());

    let policy = plane.set_dispatch_policy("main", &enable(&[])).unwrap();
    assert!(policy.enabled);
    assert_eq!(policy.allow_agents, AllowAgents::Wildcard);
    assert_eq!(
        sandbox.config()["agents"]["list"][0],
        json!({ "id": "main", "subagents": { "allowAgents": ["*"] } })
    );
}

#[test]
fn empty_allow_list_is_rejected_when_configured() {
    let mut sandbox = Sandbox::new();
    sandbox.settings.dispatch_default_allow = DispatchDefaultAllow::Reject;
    let plane = sandbox.open(sandbox.runtime());

    let failure = plane.set_dispatch_policy("main", &enable(&["", "  "])).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert_eq!(failure.field.as_deref(), Some("allowAgents"));
    assert!(!sandbox.settings.config_path.exists());

    let policy = plane.set_dispatch_policy("main", &enable(&["coder"])).unwrap();
    assert_eq!(policy.allow_agents, AllowAgents::Only(vec!["coder".to_string()]));
}

#[test]
fn allow_list_is_cleaned_and_disable_empties_it() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let policy = plane
        .set_dispatch_policy("main", &enable(&["'coder'", "coder", " writer ", "\"research\""]))
        .unwrap();
    assert_eq!(
        policy.allow_agents,
        AllowAgents::Only(vec!["coder".into(), "writer".into(), "research".into()])
    );

    let wildcard = plane.set_dispatch_policy("main", &enable(&["coder", "*"])).unwrap();
    assert_eq!(wildcard.allow_agents, AllowAgents::Wildcard);

    let disabled = plane
        .set_dispatch_policy("main", &DispatchRequest { enabled: false, allow_agents: vec!["coder".into()], ..DispatchRequest::default() })
        .unwrap();
    assert!(!disabled.enabled);
    assert_eq!(sandbox.config()["agents"]["list"][0]["subagents"]["allowAgents"], json!([]));
}

#[test]
fn concurrency_inherits_global_then_default() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    let status = plane.dispatch_status("main").unwrap();
    assert_eq!((status.max_concurrent, status.max_concurrent_source), (8, ConcurrencySource::Default));

    assert!(plane.set_global_max_concurrent(4).unwrap());
    assert!(!plane.set_global_max_concurrent(4).unwrap());
    let status = plane.dispatch_status("main").unwrap();
    assert_eq!((status.max_concurrent, status.max_concurrent_source), (4, ConcurrencySource::Global));

    let own = plane
        .set_dispatch_policy("main", &DispatchRequest { max_concurrent: Some(2), ..enable(&["coder"]) })
        .unwrap();
    assert_eq!((own.max_concurrent, own.max_concurrent_source), (2, ConcurrencySource::Agent));
    assert_eq!(own.max_concurrent_override, Some(2));

    // Changing only the allow list keeps the override.
    let kept = plane.set_dispatch_policy("main", &enable(&["writer"])).unwrap();
    assert_eq!(kept.max_concurrent_override, Some(2));

    let inherited = plane
        .set_dispatch_policy("main", &DispatchRequest { inherit_max_concurrent: true, ..enable(&["writer"]) })
        .unwrap();
    assert_eq!(inherited.max_concurrent_override, None);
    assert_eq!((inherited.max_concurrent, inherited.max_concurrent_source), (4, ConcurrencySource::Global));

    let state = plane.state().unwrap();
    assert_eq!(state.max_concurrent, 4);
    assert_eq!(state.dispatch.len(), 1);
}

#[test]
fn invalid_concurrency_is_rejected() {
    let sandbox = Sandbox::new();
    let plane = sandbox.open(sandbox.runtime());

    assert_eq!(plane.set_global_max_concurrent(0).unwrap_err().kind, ErrorKind::Validation);
    let failure = plane
        .set_dispatch_policy("main", &DispatchRequest { max_concurrent: Some(-3), ..enable(&["coder"]) })
        .unwrap_err();
    assert_eq!(failure.field.as_deref(), Some("maxConcurrent"));
    let failure = plane
        .set_dispatch_policy(
            "main",
            &DispatchRequest { max_concurrent: Some(2), inherit_max_concurrent: true, ..enable(&["coder"]) },
        )
        .unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Validation);
    assert!(!sandbox.settings.config_path.exists());
}
