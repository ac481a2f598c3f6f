//! clawdeck's own settings.
//!
//! Loaded with the `config` crate. Precedence, lowest first: built-in defaults
//! (which honour the runtime's `OPENCLAW_*` path variables), the optional
//! settings file named by `CLAWDECK_CONFIG` (default `config/clawdeck.toml`),
//! then `CLAWDECK__*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when dispatch is enabled with an empty allow list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchDefaultAllow {
    /// Persist `["*"]`, allowing every agent.
    #[default]
    Wildcard,
    /// Reject the request with a validation error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckConfig {
    /// The runtime's primary configuration file.
    pub config_path: PathBuf,
    /// Flat directory of timestamped copies of the primary file.
    pub backup_dir: PathBuf,
    /// The runtime's secondary credential store.
    pub auth_profiles_path: PathBuf,
    /// The runtime's cached model catalog (fallback only).
    pub models_cache_path: PathBuf,
    /// Adapter configuration for non-official search sources.
    pub search_adapters_path: PathBuf,
    /// Runtime executable, resolved through `PATH` when not absolute.
    pub runtime_bin: String,
    pub runtime_timeout_secs: u64,
    pub http_timeout_secs: u64,
    /// Process-wide sub-agent concurrency when the file sets none.
    pub default_max_concurrent: u32,
    /// How many backups a listing returns by default.
    pub backup_list_limit: usize,
    pub dispatch_default_allow: DispatchDefaultAllow,
    /// Compute and validate mutations without writing anything.
    pub dry_run: bool,
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// The runtime's state directory: `OPENCLAW_HOME`, else `~/.openclaw`.
pub fn runtime_home() -> PathBuf {
    if let Some(home) = env_opt_string("OPENCLAW_HOME") {
        return PathBuf::from(home);
    }
    env_opt_string("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".openclaw")
}

fn path_default(env: &str, fallback: PathBuf) -> String {
    env_opt_string(env).unwrap_or_else(|| fallback.to_string_lossy().into_owned())
}

impl DeckConfig {
    /// Load settings from defaults, the settings file and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let home = runtime_home();
        let agent_dir = home.join("agents").join("main").join("agent");
        let settings_path =
            std::env::var("CLAWDECK_CONFIG").unwrap_or_else(|_| "config/clawdeck".to_string());

        let builder = config::Config::builder()
            .set_default(
                "config_path",
                path_default("OPENCLAW_CONFIG_PATH", home.join("openclaw.json")),
            )?
            .set_default(
                "backup_dir",
                path_default("OPENCLAW_BACKUP_DIR", home.join("backups")),
            )?
            .set_default(
                "auth_profiles_path",
                path_default("OPENCLAW_AUTH_PROFILES_PATH", agent_dir.join("auth-profiles.json")),
            )?
            .set_default(
                "models_cache_path",
                path_default("OPENCLAW_MODELS_JSON", agent_dir.join("models.json")),
            )?
            .set_default(
                "search_adapters_path",
                path_default(
                    "OPENCLAW_SEARCH_ADAPTERS_PATH",
                    home.join("clawdeck").join("search_adapters.json"),
                ),
            )?
            .set_default(
                "runtime_bin",
                env_opt_string("OPENCLAW_BIN").unwrap_or_else(|| "openclaw".to_string()),
            )?
            .set_default("runtime_timeout_secs", 60_i64)?
            .set_default("http_timeout_secs", 10_i64)?
            .set_default("default_max_concurrent", 8_i64)?
            .set_default("backup_list_limit", 20_i64)?
            .set_default("dispatch_default_allow", "wildcard")?
            .set_default("dry_run", env_bool("CLAWDECK_DRY_RUN", false))?;

        let built = builder
            .add_source(config::File::with_name(&settings_path).required(false))
            .add_source(
                config::Environment::with_prefix("CLAWDECK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        built.try_deserialize()
    }

    /// Settings with every file placed under `dir`; used by tests and sandboxes.
    pub fn rooted(dir: &Path) -> Self {
        let agent_dir = dir.join("agents").join("main").join("agent");
        Self {
            config_path: dir.join("openclaw.json"),
            backup_dir: dir.join("backups"),
            auth_profiles_path: agent_dir.join("auth-profiles.json"),
            models_cache_path: agent_dir.join("models.json"),
            search_adapters_path: dir.join("clawdeck").join("search_adapters.json"),
            runtime_bin: "openclaw".to_string(),
            runtime_timeout_secs: 60,
            http_timeout_secs: 10,
            default_max_concurrent: 8,
            backup_list_limit: 20,
            dispatch_default_allow: DispatchDefaultAllow::Wildcard,
            dry_run: false,
        }
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}
