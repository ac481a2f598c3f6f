//! The external agent runtime, seen as a capability.
//!
//! [`AgentRuntime`] is the only way this crate reaches the runtime: live
//! catalog listing, official credential writes and OAuth starts. Every call
//! is bounded by a timeout and never retried here; the caller owns retry
//! policy. A timeout surfaces as [`ReconcileError::CollaboratorTimeout`], a
//! process that could not be started as
//! [`ReconcileError::CollaboratorUnavailable`], and a credential write the
//! runtime refused as [`ReconcileError::Validation`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, ReconcileResult};

/// One model as reported by a catalog, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: String,
    pub name: String,
}

impl CatalogEntry {
    /// Build from a catalog JSON object using the first of `key`, `id`, `name`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = ["key", "id", "name"]
            .iter()
            .find_map(|field| value.get(*field).and_then(Value::as_str))
            .map(str::trim)
            .filter(|k| !k.is_empty())?
            .to_string();
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&key)
            .to_string();
        Some(Self { key, name })
    }
}

/// An official API-key credential to hand to the runtime.
#[derive(Debug, Clone)]
pub struct CredentialWrite {
    pub provider: String,
    pub auth_choice: String,
    /// Name of the onboarding flag carrying the key, without leading dashes.
    pub key_flag: String,
    pub api_key: String,
}

/// What an OAuth start produced for the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStart {
    pub provider: String,
    pub method: Option<String>,
    pub url: Option<String>,
    pub code: Option<String>,
    /// The runtime insists on an interactive terminal for this flow.
    pub requires_tty: bool,
    pub recommended_command: Option<String>,
    pub raw: String,
}

impl OAuthStart {
    pub fn has_handoff(&self) -> bool {
        self.url.is_some() || self.code.is_some()
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Live catalog for one provider.
    async fn query_catalog(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>>;

    /// Schema-validated credential write for an official provider.
    async fn write_official_credential(&self, write: &CredentialWrite) -> ReconcileResult<()>;

    /// Begin an OAuth or device-code flow.
    async fn start_oauth(&self, provider: &str, method: Option<&str>) -> ReconcileResult<OAuthStart>;
}

// ---------------------------------------------------------------------------
// CLI-backed runtime
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CliOutput {
    fn combined(&self) -> String {
        [self.stdout.trim(), self.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn failure_reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            "runtime exited with a failure status".to_string()
        } else {
            text.to_string()
        }
    }
}

/// Flags that keep onboarding to the credential step only.
const ONBOARD_SKIP_FLAGS: [&str; 6] = [
    "--skip-channels",
    "--skip-skills",
    "--skip-health",
    "--skip-ui",
    "--no-install-daemon",
    "--json",
];

/// Runs the runtime executable as a subprocess.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    bin: String,
    timeout: Duration,
    config_path: Option<PathBuf>,
}

impl CliRuntime {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
            config_path: None,
        }
    }

    /// Point the runtime at a specific configuration file.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    async fn run(&self, args: &[&str]) -> ReconcileResult<CliOutput> {
        let mut command = tokio::process::Command::new(&self.bin);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            command.env("OPENCLAW_CONFIG_PATH", path);
        }

        debug!(target: "clawdeck::runtime", bin = %self.bin, command = %args.first().copied().unwrap_or(""), "invoking runtime");
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                warn!(target: "clawdeck::runtime", bin = %self.bin, timeout = ?self.timeout, "runtime call timed out");
                return Err(ReconcileError::CollaboratorTimeout(self.timeout));
            }
            Ok(Err(e)) => {
                return Err(ReconcileError::CollaboratorUnavailable(format!(
                    "failed to start `{}`: {e}",
                    self.bin
                )))
            }
            Ok(Ok(output)) => output,
        };

        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl AgentRuntime for CliRuntime {
    async fn query_catalog(&self, provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        let output = self
            .run(&["models", "list", "--all", "--provider", provider, "--json"])
            .await?;
        if !output.success {
            return Err(ReconcileError::CollaboratorUnavailable(output.failure_reason()));
        }
        let payload = parse_json_output(&output.stdout).ok_or_else(|| {
            ReconcileError::CollaboratorUnavailable("catalog output is not JSON".to_string())
        })?;
        Ok(payload
            .get("models")
            .and_then(Value::as_array)
            .map(|models| models.iter().filter_map(CatalogEntry::from_value).collect())
            .unwrap_or_default())
    }

    async fn write_official_credential(&self, write: &CredentialWrite) -> ReconcileResult<()> {
        let flag = format!("--{}", write.key_flag);
        let mut args = vec![
            "onboard",
            "--non-interactive",
            "--accept-risk",
            "--auth-choice",
            write.auth_choice.as_str(),
            flag.as_str(),
            write.api_key.as_str(),
        ];
        args.extend(ONBOARD_SKIP_FLAGS);

        let output = self.run(&args).await?;
        if !output.success {
            return Err(ReconcileError::validation(
                format!("providers.{}", write.provider),
                output.failure_reason(),
            ));
        }
        info!(target: "clawdeck::runtime", provider = %write.provider, choice = %write.auth_choice, "official credential written by runtime");
        Ok(())
    }

    async fn start_oauth(&self, provider: &str, method: Option<&str>) -> ReconcileResult<OAuthStart> {
        let method = method.map(str::trim).filter(|m| !m.is_empty());
        let choice = method.unwrap_or(provider);

        let mut onboard = vec!["onboard", "--non-interactive", "--accept-risk", "--auth-choice", choice];
        onboard.extend(ONBOARD_SKIP_FLAGS);
        let first = self.run(&onboard).await?.combined();
        let (url, code) = extract_oauth_handoff(&first);
        if url.is_some() || code.is_some() {
            return Ok(OAuthStart {
                provider: provider.to_string(),
                method: method.map(str::to_string),
                url,
                code,
                requires_tty: false,
                recommended_command: None,
                raw: first,
            });
        }

        let mut login = vec!["models", "auth", "login", "--provider", provider];
        if let Some(m) = method.filter(|m| *m != provider) {
            login.extend(["--method", m]);
        }
        let second = self.run(&login).await?.combined();
        let (url, code) = extract_oauth_handoff(&second);
        let raw = [first.as_str(), second.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let requires_tty = needs_tty(&raw);
        let recommended_command = requires_tty.then(|| {
            let mut cmd = format!("{} models auth login --provider {provider}", self.bin);
            if let Some(m) = method.filter(|m| *m != provider) {
                cmd.push_str(&format!(" --method {m}"));
            }
            cmd
        });

        Ok(OAuthStart {
            provider: provider.to_string(),
            method: method.map(str::to_string),
            url,
            code,
            requires_tty,
            recommended_command,
            raw,
        })
    }
}

// ---------------------------------------------------------------------------
// Offline runtime
// ---------------------------------------------------------------------------

/// Stand-in used when the runtime is deliberately not consulted. Every call
/// reports the collaborator as unavailable, so catalog reads fall back to the
/// cache and credential writes fail loudly.
#[derive(Debug, Clone, Default)]
pub struct OfflineRuntime;

#[async_trait]
impl AgentRuntime for OfflineRuntime {
    async fn query_catalog(&self, _provider: &str) -> ReconcileResult<Vec<CatalogEntry>> {
        Err(ReconcileError::CollaboratorUnavailable("runtime is offline".to_string()))
    }

    async fn write_official_credential(&self, _write: &CredentialWrite) -> ReconcileResult<()> {
        Err(ReconcileError::CollaboratorUnavailable("runtime is offline".to_string()))
    }

    async fn start_oauth(&self, _provider: &str, _method: Option<&str>) -> ReconcileResult<OAuthStart> {
        Err(ReconcileError::CollaboratorUnavailable("runtime is offline".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)]+").expect("valid url regex"));
static LABELLED_CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:code|验证码|授权码)\s*[:：]\s*([A-Z0-9-]{4,})").expect("valid code regex")
});
static BARE_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z0-9]{4,}(?:-[A-Z0-9]{4,})+)\b").expect("valid device code regex"));

/// Pull a verification URL and device/user code out of runtime output.
pub fn extract_oauth_handoff(raw: &str) -> (Option<String>, Option<String>) {
    let url = URL_RE.find(raw).map(|m| m.as_str().to_string());
    let code = LABELLED_CODE_RE
        .captures(raw)
        .or_else(|| BARE_CODE_RE.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    (url, code)
}

fn needs_tty(raw: &str) -> bool {
    raw.contains("interactive TTY") || raw.contains("requires a TTY")
}

/// Parse JSON from CLI stdout, skipping any log lines printed before it.
pub fn parse_json_output(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find(['{', '['])?;
    serde_json::from_str(&trimmed[start..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_oauth_handoff() {
        let raw = "Open https://github.com/login/device and enter code: ABCD-1234\n";
        let (url, code) = extract_oauth_handoff(raw);
        assert_eq!(url.as_deref(), Some("https://github.com/login/device"));
        assert_eq!(code.as_deref(), Some("ABCD-1234"));

        let (url, code) = extract_oauth_handoff("visit (https://x.test/auth) then type WXYZ-9876-QRST");
        assert_eq!(url.as_deref(), Some("https://x.test/auth"));
        assert_eq!(code.as_deref(), Some("WXYZ-9876-QRST"));

        assert_eq!(extract_oauth_handoff("nothing here"), (None, None));
    }

    #[test]
    fn test_parse_json_output_skips_preamble() {
        let out = "[plugins] loaded 3\n{\"models\":[{\"key\":\"groq/llama\"}]}";
        let v = parse_json_output(out).unwrap();
        assert_eq!(v["models"][0]["key"], "groq/llama");
        assert!(parse_json_output("no json").is_none());
    }

    #[test]
    fn test_catalog_entry_from_value() {
        let entry = CatalogEntry::from_value(&serde_json::json!({ "id": "auto", "name": "" })).unwrap();
        assert_eq!(entry, CatalogEntry { key: "auto".into(), name: "auto".into() });
        assert!(CatalogEntry::from_value(&serde_json::json!({ "label": "x" })).is_none());
    }

    #[test]
    fn test_needs_tty() {
        assert!(needs_tty("Error: this flow requires an interactive TTY"));
        assert!(!needs_tty("ok"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let runtime = CliRuntime::new("/nonexistent/clawdeck-test-runtime", Duration::from_secs(5));
        let err = runtime.query_catalog("openai").await.unwrap_err();
        assert!(matches!(err, ReconcileError::CollaboratorUnavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_runtime_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-runtime");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = CliRuntime::new(script.to_string_lossy(), Duration::from_millis(200));
        let err = runtime.query_catalog("openai").await.unwrap_err();
        assert!(matches!(err, ReconcileError::CollaboratorTimeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_catalog_parses_models() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("runtime");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'warming up'\necho '{\"models\":[{\"key\":\"groq/llama-3\",\"name\":\"Llama 3\"},{\"id\":\"mixtral\"}]}'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = CliRuntime::new(script.to_string_lossy(), Duration::from_secs(5));
        let entries = runtime.query_catalog("groq").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Llama 3");
        assert_eq!(entries[1].key, "mixtral");
    }
}
