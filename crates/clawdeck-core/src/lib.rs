//! clawdeck-core: state reconciliation for an external agent runtime's configuration.
//!
//! The runtime owns a primary JSON file plus several satellite files (credential
//! store, cached catalog, search adapters). This crate keeps them consistent:
//!
//! - **Normalization:** every model key becomes `provider/name` before it is
//!   compared or written ([`normalize_key`]).
//! - **Atomic mutation:** [`ConfigStore::mutate`] backs up, transforms in memory,
//!   validates, writes a temp file, checks for concurrent writers, then renames.
//! - **Source merging:** live runtime catalog first, cached file second; auth
//!   profiles are the union of both credential stores ([`SourceMerger`]).
//! - **Policy:** global, per-agent and spawn model policies plus per-agent
//!   dispatch rules, each write confirmed by a read-back.
//! - **Self-heal:** one startup pass that rewrites legacy and quote-polluted
//!   data ([`SelfHeal`]).
//!
//! [`ControlPlane`] is the request surface over all of it.

pub mod activation;
pub mod backup;
pub mod config;
pub mod error;
pub mod heal;
mod layout;
pub mod merger;
pub mod model;
pub mod normalize;
pub mod policy;
pub mod providers;
pub mod runtime;
pub mod satellite;
pub mod schema;
pub mod search;
pub mod service;
pub mod store;

pub use activation::{ActivationChange, ActivationEngine, ActiveModel, KeyOutcome, Presence};
pub use backup::{humanize_age, BackupListing, BackupManager};
pub use config::{DeckConfig, DispatchDefaultAllow};
pub use error::{ErrorKind, ReconcileError, ReconcileResult};
pub use heal::{heal_tree, HealReport, KeyRewrite, SelfHeal, TreeRepairs};
pub use merger::{
    CachedCatalogSource, CatalogReport, CatalogSource, EndpointCatalogSource, Freshness,
    LiveCatalogSource, SourceMerger,
};
pub use model::{
    AllowAgents, AuthMethod, AuthProfile, Availability, ConcurrencySource, DispatchPolicy,
    ModelPolicy, ModelRecord, ProfileSource, Protocol, ProviderRecord,
};
pub use normalize::{normalize_key, normalize_provider, ModelKey};
pub use policy::{
    AgentOverride, DispatchRequest, EffectivePolicy, PolicyChange, PolicyReconciler, PolicyScope,
    PolicySource,
};
pub use providers::{
    CredentialOutcome, CustomProviderOutcome, CustomProviderRequest, DeleteOutcome, ProviderManager,
};
pub use runtime::{AgentRuntime, CatalogEntry, CliRuntime, CredentialWrite, OAuthStart, OfflineRuntime};
pub use satellite::{AuthProfileStore, CatalogCache, JsonFile};
pub use search::{
    AdapterPatch, AdapterSettings, FailoverChain, OfficialSearch, OfficialSearchState,
    SearchAdapterFile, SearchSettings, SourceRef,
};
pub use service::{ControlPlane, Failure, Outcome, StateView};
pub use store::{
    BackupEntry, ConfigSnapshot, ConfigStore, MutationReceipt, RestoreReceipt, StoreConfig,
};
