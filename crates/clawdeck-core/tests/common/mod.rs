//! Shared fixtures for integration tests: an in-memory runtime and a sandboxed home.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clawdeck_core::{
    AgentRuntime, CatalogEntry, ControlPlane, CredentialWrite, DeckConfig, OAuthStart,
    ReconcileError, ReconcileResult,
};
use serde_json::{json, Value};

/// Runtime double. Credential writes land in the auth-profile store the way
/// the real onboarding command does.
#[derive(Default)]
pub struct FakeRuntime {
    pub auth_profiles_path: PathBuf,
    pub catalogs: Mutex<HashMap<String, Vec<CatalogEntry>>>,
    pub offline: bool,
    /// Accept credential writes without recording a profile.
    pub drop_writes: bool,
    pub writes: Mutex<Vec<CredentialWrite>>,
}

impl FakeRuntime {
    pub fn new(auth_profiles_path: impl Into<PathBuf>) -> Self {
        Self {
            auth_profiles_path: auth_profiles_path.into(),
            ..Self::default()
        }
    }

    pub fn with_catalog(self, provider: &str, keys: &[&str]) -> Self {
        let entries = keys
            .iter()
            .map(|k| CatalogEntry {
                key: k.to_string(),
                name: k.to_string(),
            })
            .collect();
        self.catalogs.lock().unwrap().insert(provider.to_string(), entries);
        self
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn query_catalog(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        if self.offline {
            return Err(ReconcileError::CollaboratorUnavailable("fake runtime offline".to_string()));
        }
        Ok(self.catalogs.lock().unwrap().get(provider).cloned().unwrap_or_default())
    }

    async fn write_official_credential(&self, write: &CredentialWrite) -> ReconcileResult<()> {
        if self.offline {
            return Err(ReconcileError::CollaboratorUnavailable("fake runtime offline".to_string()));
        }
        self.writes.lock().unwrap().push(write.clone());
        if self.drop_writes {
            return Ok(());
        }
        let mut root = std::fs::read(&self.auth_profiles_path)
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok())
            .unwrap_or_else(|| json!({ "version": 1, "profiles": {} }));
        root["profiles"][format!("{}:default", write.provider)] = json!({
            "type": "api_key",
            "provider": write.provider,
            "key": write.api_key,
        });
        write_json(&self.auth_profiles_path, &root);
        Ok(())
    }

    async fn start_oauth(&self, provider: &str, method: Option<&str>) -> ReconcileResult<OAuthStart> {
        Ok(OAuthStart {
            provider: provider.to_string(),
            method: method.map(str::to_string),
            url: Some("https://example.test/device".to_string()),
            code: Some("ABCD-EFGH".to_string()),
            ..OAuthStart::default()
        })
    }
}

pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub settings: DeckConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = DeckConfig::rooted(dir.path());
        Self { dir, settings }
    }

    pub fn runtime(&self) -> FakeRuntime {
        FakeRuntime::new(&self.settings.auth_profiles_path)
    }

    pub fn open(&self, runtime: FakeRuntime) -> ControlPlane {
        ControlPlane::open(self.settings.clone(), Arc::new(runtime))
    }

    pub fn write_config(&self, value: &Value) {
        write_json(&self.settings.config_path, value);
    }

    pub fn config(&self) -> Value {
        read_json(&self.settings.config_path)
    }

    pub fn config_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.settings.config_path).unwrap()
    }

    pub fn write_auth_profiles(&self, profiles: Value) {
        write_json(
            &self.settings.auth_profiles_path,
            &json!({ "version": 1, "profiles": profiles }),
        );
    }

    pub fn auth_profiles(&self) -> Value {
        read_json(&self.settings.auth_profiles_path)["profiles"].clone()
    }
}

pub fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
}

pub fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}
