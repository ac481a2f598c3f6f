//! Policy Reconciler
//!
//! Model policy exists at three scopes: global (`agents.defaults.model`),
//! per agent (`agents.list[i].model`) and spawn default
//! (`agents.defaults.subagents.model`). An agent policy replaces the global one
//! wholesale; there is no field-level merge. The spawn policy inherits the
//! global one only while it has never been set.
//!
//! Dispatch policy lives under `agents.list[i].subagents`.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::activation::active_keys;
use crate::config::DispatchDefaultAllow;
use crate::error::{ReconcileError, ReconcileResult};
use crate::layout;
use crate::model::{AllowAgents, ConcurrencySource, DispatchPolicy, ModelPolicy};
use crate::normalize::{normalize_agent_id, ModelKey};
use crate::search::{FailoverChain, SearchSettings};
use crate::store::{BackupEntry, ConfigStore};

const SUBAGENTS: &str = "subagents";
const ALLOW_AGENTS: &str = "allowAgents";
const MAX_CONCURRENT: &str = "maxConcurrent";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyScope {
    Global,
    Agent(String),
    Spawn,
}

impl PolicyScope {
    pub fn describe(&self) -> String {
        match self {
            PolicyScope::Global => "agents.defaults.model".to_string(),
            PolicyScope::Agent(id) => format!("agents.list[{id}].model"),
            PolicyScope::Spawn => "agents.defaults.subagents.model".to_string(),
        }
    }
}

/// Where an effective policy was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Agent,
    Global,
    Spawn,
    /// Spawn scope never set; global applies.
    InheritedGlobal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub policy: ModelPolicy,
    pub source: PolicySource,
    /// Referenced keys that are not in the active set. Configured, but
    /// currently unavailable.
    pub unavailable: Vec<ModelKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverride {
    pub agent_id: String,
    pub policy: ModelPolicy,
}

/// Result of a policy write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChange {
    pub scope: String,
    pub policy: ModelPolicy,
    pub changed: bool,
    pub backup: Option<BackupEntry>,
    pub dry_run: bool,
}

/// Requested dispatch settings for one agent.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub enabled: bool,
    pub allow_agents: Vec<String>,
    pub max_concurrent: Option<i64>,
    /// Drop the per-agent override and follow the process-wide value.
    pub inherit_max_concurrent: bool,
}

pub struct PolicyReconciler {
    store: Arc<ConfigStore>,
    search: Arc<SearchSettings>,
    default_max_concurrent: u32,
    default_allow: DispatchDefaultAllow,
}

// ---------------------------------------------------------------------------
// Tree access
// ---------------------------------------------------------------------------

fn policy_value<'a>(root: &'a Value, scope: &PolicyScope) -> Option<&'a Value> {
    match scope {
        PolicyScope::Global => layout::object_at(root, layout::AGENT_DEFAULTS)?.get(layout::MODEL_FIELD),
        PolicyScope::Spawn => layout::object_at(root, layout::SUBAGENT_DEFAULTS)?.get(layout::MODEL_FIELD),
        PolicyScope::Agent(id) => layout::find_agent(root, id)?.get(layout::MODEL_FIELD),
    }
}

/// The stored policy at `scope`; `None` when unset or empty.
pub fn stored_policy(root: &Value, scope: &PolicyScope) -> ReconcileResult<Option<ModelPolicy>> {
    match policy_value(root, scope) {
        None => Ok(None),
        Some(value) => {
            let policy = ModelPolicy::from_value(value)
                .map_err(|e| ReconcileError::validation(scope.describe(), e.to_string()))?;
            Ok(Some(policy).filter(|p| !p.is_empty()))
        }
    }
}

fn write_policy(root: &mut Value, scope: &PolicyScope, policy: &ModelPolicy) -> ReconcileResult<()> {
    if policy.is_empty() {
        clear_policy(root, scope);
        return Ok(());
    }
    let holder = match scope {
        PolicyScope::Global => layout::object_at_mut(root, layout::AGENT_DEFAULTS)?,
        PolicyScope::Spawn => layout::object_at_mut(root, layout::SUBAGENT_DEFAULTS)?,
        PolicyScope::Agent(id) => layout::ensure_agent(root, id)?,
    };
    holder.insert(layout::MODEL_FIELD.to_string(), policy.to_value());
    Ok(())
}

fn clear_policy(root: &mut Value, scope: &PolicyScope) {
    match scope {
        PolicyScope::Global => {
            layout::remove_at(root, layout::AGENT_DEFAULTS, layout::MODEL_FIELD);
        }
        PolicyScope::Spawn => {
            layout::remove_at(root, layout::SUBAGENT_DEFAULTS, layout::MODEL_FIELD);
        }
        PolicyScope::Agent(id) => {
            if let Some(agent) = layout::find_agent_mut(root, id) {
                agent.remove(layout::MODEL_FIELD);
            }
        }
    }
}

/// Dispatch settings of `agent_id` as stored in `root`.
pub fn stored_dispatch(root: &Value, agent_id: &str, default_max_concurrent: u32) -> DispatchPolicy {
    let subagents = layout::find_agent(root, agent_id)
        .and_then(|agent| agent.get(SUBAGENTS))
        .and_then(Value::as_object);
    let allow_agents = AllowAgents::from_value(subagents.and_then(|s| s.get(ALLOW_AGENTS)));
    let max_concurrent_override = subagents.and_then(|s| layout::positive_u32(s, MAX_CONCURRENT));
    let global = layout::object_at(root, layout::SUBAGENT_DEFAULTS)
        .and_then(|s| layout::positive_u32(s, MAX_CONCURRENT));

    let (max_concurrent, max_concurrent_source) = match (max_concurrent_override, global) {
        (Some(own), _) => (own, ConcurrencySource::Agent),
        (None, Some(global)) => (global, ConcurrencySource::Global),
        (None, None) => (default_max_concurrent, ConcurrencySource::Default),
    };
    DispatchPolicy {
        agent_id: agent_id.to_string(),
        enabled: !allow_agents.is_empty(),
        allow_agents,
        max_concurrent_override,
        max_concurrent,
        max_concurrent_source,
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

impl PolicyReconciler {
    pub fn new(
        store: Arc<ConfigStore>,
        search: Arc<SearchSettings>,
        default_max_concurrent: u32,
        default_allow: DispatchDefaultAllow,
    ) -> Self {
        Self {
            store,
            search,
            default_max_concurrent: default_max_concurrent.max(1),
            default_allow,
        }
    }

    // -----------------------------------------------------------------------
    // Model policy
    // -----------------------------------------------------------------------

    pub fn set_global_policy<S: AsRef<str>>(&self, primary: Option<&str>, fallbacks: &[S]) -> ReconcileResult<PolicyChange> {
        self.set_policy(PolicyScope::Global, ModelPolicy::from_raw(primary, fallbacks)?)
    }

    pub fn set_agent_policy<S: AsRef<str>>(
        &self,
        agent_id: &str,
        primary: Option<&str>,
        fallbacks: &[S],
    ) -> ReconcileResult<PolicyChange> {
        let agent_id = normalize_agent_id(agent_id)?;
        self.set_policy(PolicyScope::Agent(agent_id), ModelPolicy::from_raw(primary, fallbacks)?)
    }

    /// Drop an agent's override so the global policy applies again.
    pub fn clear_agent_policy(&self, agent_id: &str) -> ReconcileResult<PolicyChange> {
        let agent_id = normalize_agent_id(agent_id)?;
        self.set_policy(PolicyScope::Agent(agent_id), ModelPolicy::default())
    }

    pub fn set_spawn_policy<S: AsRef<str>>(&self, primary: Option<&str>, fallbacks: &[S]) -> ReconcileResult<PolicyChange> {
        self.set_policy(PolicyScope::Spawn, ModelPolicy::from_raw(primary, fallbacks)?)
    }

    pub fn clear_spawn_policy(&self) -> ReconcileResult<PolicyChange> {
        self.set_policy(PolicyScope::Spawn, ModelPolicy::default())
    }

    fn set_policy(&self, scope: PolicyScope, policy: ModelPolicy) -> ReconcileResult<PolicyChange> {
        let described = scope.describe();
        let action = if policy.is_empty() { "clear" } else { "set" };
        let receipt = self
            .store
            .mutate(&format!("{action} {described}"), |root| write_policy(root, &scope, &policy))?;

        let persisted = stored_policy(receipt.snapshot.root(), &scope)?.unwrap_or_default();
        if persisted != policy {
            return Err(ReconcileError::read_back(
                described,
                format!(
                    "stored policy {} differs from requested {}",
                    persisted.to_value(),
                    policy.to_value()
                ),
            ));
        }

        if receipt.changed {
            info!(
                target: "clawdeck::policy",
                scope = %described,
                primary = policy.primary.as_ref().map(ModelKey::as_str).unwrap_or(""),
                fallbacks = policy.fallbacks.len(),
                "model policy {action}"
            );
        }
        Ok(PolicyChange {
            scope: described,
            policy,
            changed: receipt.changed,
            backup: receipt.backup,
            dry_run: receipt.dry_run,
        })
    }

    /// Agent policy in full when set, otherwise the global policy verbatim.
    pub fn effective_policy(&self, agent_id: &str) -> ReconcileResult<EffectivePolicy> {
        let agent_id = normalize_agent_id(agent_id)?;
        let snapshot = self.store.read()?;
        let root = snapshot.root();
        let (policy, source) = match stored_policy(root, &PolicyScope::Agent(agent_id))? {
            Some(policy) => (policy, PolicySource::Agent),
            None => (
                stored_policy(root, &PolicyScope::Global)?.unwrap_or_default(),
                PolicySource::Global,
            ),
        };
        Ok(with_availability(root, policy, source))
    }

    pub fn effective_spawn_policy(&self) -> ReconcileResult<EffectivePolicy> {
        let snapshot = self.store.read()?;
        let root = snapshot.root();
        let (policy, source) = match stored_policy(root, &PolicyScope::Spawn)? {
            Some(policy) => (policy, PolicySource::Spawn),
            None => (
                stored_policy(root, &PolicyScope::Global)?.unwrap_or_default(),
                PolicySource::InheritedGlobal,
            ),
        };
        Ok(with_availability(root, policy, source))
    }

    pub fn global_policy(&self) -> ReconcileResult<ModelPolicy> {
        let snapshot = self.store.read()?;
        Ok(stored_policy(snapshot.root(), &PolicyScope::Global)?.unwrap_or_default())
    }

    /// Every agent that carries its own model policy, in list order.
    pub fn agent_overrides(&self) -> ReconcileResult<Vec<AgentOverride>> {
        let snapshot = self.store.read()?;
        let root = snapshot.root();
        let mut out = Vec::new();
        for id in layout::agent_list(root).iter().filter_map(layout::agent_id) {
            if let Some(policy) = stored_policy(root, &PolicyScope::Agent(id.to_string()))? {
                out.push(AgentOverride {
                    agent_id: id.to_string(),
                    policy,
                });
            }
        }
        Ok(out)
    }

    pub fn agent_ids(&self) -> ReconcileResult<Vec<String>> {
        let snapshot = self.store.read()?;
        Ok(layout::agent_list(snapshot.root())
            .iter()
            .filter_map(layout::agent_id)
            .map(str::to_string)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    pub fn dispatch_status(&self, agent_id: &str) -> ReconcileResult<DispatchPolicy> {
        let agent_id = normalize_agent_id(agent_id)?;
        let snapshot = self.store.read()?;
        Ok(stored_dispatch(snapshot.root(), &agent_id, self.default_max_concurrent))
    }

    /// Process-wide sub-agent concurrency and where it came from.
    pub fn global_max_concurrent(&self) -> ReconcileResult<(u32, ConcurrencySource)> {
        let snapshot = self.store.read()?;
        Ok(
            match layout::object_at(snapshot.root(), layout::SUBAGENT_DEFAULTS)
                .and_then(|s| layout::positive_u32(s, MAX_CONCURRENT))
            {
                Some(global) => (global, ConcurrencySource::Global),
                None => (self.default_max_concurrent, ConcurrencySource::Default),
            },
        )
    }

    pub fn set_global_max_concurrent(&self, max_concurrent: i64) -> ReconcileResult<bool> {
        let max = positive(max_concurrent, "agents.defaults.subagents.maxConcurrent")?;
        let receipt = self.store.mutate("set global maxConcurrent", |root| {
            layout::object_at_mut(root, layout::SUBAGENT_DEFAULTS)?
                .insert(MAX_CONCURRENT.to_string(), Value::from(max));
            Ok(())
        })?;
        info!(target: "clawdeck::policy", max_concurrent = max, changed = receipt.changed, "global sub-agent concurrency set");
        Ok(receipt.changed)
    }

    /// Resolve a request into the allow list it persists.
    fn resolve_allow(&self, request: &DispatchRequest) -> ReconcileResult<AllowAgents> {
        if !request.enabled {
            return Ok(AllowAgents::Only(Vec::new()));
        }
        let allow = AllowAgents::from_ids(&request.allow_agents);
        if !allow.is_empty() {
            return Ok(allow);
        }
        match self.default_allow {
            DispatchDefaultAllow::Wildcard => Ok(AllowAgents::Wildcard),
            DispatchDefaultAllow::Reject => Err(ReconcileError::validation(
                ALLOW_AGENTS,
                "dispatch enabled with an empty allow list",
            )),
        }
    }

    pub fn set_dispatch_policy(&self, agent_id: &str, request: &DispatchRequest) -> ReconcileResult<DispatchPolicy> {
        let agent_id = normalize_agent_id(agent_id)?;
        if request.inherit_max_concurrent && request.max_concurrent.is_some() {
            return Err(ReconcileError::validation(
                MAX_CONCURRENT,
                "maxConcurrent and inheritMaxConcurrent are mutually exclusive",
            ));
        }
        let max_concurrent = match request.max_concurrent {
            Some(raw) => Some(positive(raw, MAX_CONCURRENT)?),
            None => None,
        };
        let allow = self.resolve_allow(request)?;

        let receipt = self.store.mutate(&format!("set dispatch for {agent_id}"), |root| {
            let agent = layout::ensure_agent(root, &agent_id)?;
            let subagents = agent
                .entry(SUBAGENTS.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or_else(|| ReconcileError::validation(format!("agents.list[{agent_id}].subagents"), "expected an object"))?;
            subagents.insert(ALLOW_AGENTS.to_string(), allow.to_value());
            if request.inherit_max_concurrent {
                subagents.remove(MAX_CONCURRENT);
            } else if let Some(max) = max_concurrent {
                subagents.insert(MAX_CONCURRENT.to_string(), Value::from(max));
            }
            Ok(())
        })?;

        let persisted = stored_dispatch(receipt.snapshot.root(), &agent_id, self.default_max_concurrent);
        let expected_override = if request.inherit_max_concurrent {
            None
        } else {
            max_concurrent.or(persisted.max_concurrent_override)
        };
        if persisted.allow_agents != allow || persisted.max_concurrent_override != expected_override {
            return Err(ReconcileError::read_back(
                format!("agents.list[{agent_id}].subagents"),
                "stored dispatch policy differs from the request",
            ));
        }

        info!(
            target: "clawdeck::policy",
            agent = %agent_id,
            enabled = persisted.enabled,
            max_concurrent = persisted.max_concurrent,
            source = ?persisted.max_concurrent_source,
            "dispatch policy saved"
        );
        Ok(persisted)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub fn set_search_failover_chain<S: AsRef<str>>(
        &self,
        primary: Option<&str>,
        fallbacks: &[S],
    ) -> ReconcileResult<FailoverChain> {
        self.search.set_failover_chain(primary, fallbacks)
    }
}

fn positive(raw: i64, field: &str) -> ReconcileResult<u32> {
    if raw < 1 {
        return Err(ReconcileError::validation(field, format!("must be at least 1, got {raw}")));
    }
    u32::try_from(raw).map_err(|_| ReconcileError::validation(field, format!("{raw} is out of range")))
}

fn with_availability(root: &Value, policy: ModelPolicy, source: PolicySource) -> EffectivePolicy {
    let active: BTreeSet<ModelKey> = active_keys(root);
    let unavailable = policy.keys().filter(|k| !active.contains(*k)).cloned().collect();
    EffectivePolicy {
        policy,
        source,
        unavailable,
    }
}
