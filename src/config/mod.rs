//! Configuration loading and management.
//!
//! Loads configuration from `./armitage.toml` (or `$ARMITAGE_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
///
/// Path: `./armitage.toml` or `$ARMITAGE_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArmitageConfig {
    /// Execution engine settings.
    pub engine: EngineConfig,
    /// Container sandbox settings.
    pub sandbox: SandboxConfig,
    /// Filesystem paths for catalogue, wordlists, and audit output.
    pub paths: PathsConfig,
    /// LLM provider configuration for the strategic planner.
    pub llm: LlmConfig,
    /// Human-in-the-loop approval settings.
    pub approval: ApprovalConfig,
}

impl ArmitageConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: ArmitageConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(ArmitageConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("ARMITAGE_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("armitage.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Engine.
        if let Some(v) = env("ARMITAGE_MAX_CONCURRENCY") {
            match v.parse() {
                Ok(n) => self.engine.max_concurrency = n,
                Err(_) => tracing::warn!(
                    var = "ARMITAGE_MAX_CONCURRENCY",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Paths.
        if let Some(v) = env("ARMITAGE_AUDIT_DIR") {
            self.paths.audit_dir = v;
        }
        if let Some(v) = env("ARMITAGE_CATALOG_FILE") {
            self.paths.catalog_file = Some(v);
        }
        if let Some(v) = env("ARMITAGE_WORDLIST_HOST_ROOT") {
            self.paths.wordlist_host_root = v;
        }

        // LLM -- Anthropic (env var presence creates the provider).
        if let Some(key) = env("ARMITAGE_ANTHROPIC_API_KEY") {
            let model = env("ARMITAGE_ANTHROPIC_MODEL").unwrap_or_else(|| {
                self.llm
                    .anthropic
                    .as_ref()
                    .map(|c| c.model.clone())
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_owned())
            });
            self.llm.anthropic = Some(LlmCloudConfig {
                api_key: key,
                model,
            });
        }
        if let Some(v) = env("ARMITAGE_LLM_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.llm.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "ARMITAGE_LLM_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: ArmitageConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Engine config ───────────────────────────────────────────────

/// Execution engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global in-flight execution cap (semaphore permits).
    pub max_concurrency: usize,
    /// Default per-request timeout in seconds when the caller gives none.
    pub default_timeout_secs: u64,
    /// Floor for per-target timeout when a multi-target request is split.
    pub min_per_target_timeout_secs: u64,
    /// Tree executor re-enqueue tick in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            default_timeout_secs: 300,
            min_per_target_timeout_secs: 60,
            poll_interval_ms: 1000,
        }
    }
}

// ── Sandbox config ──────────────────────────────────────────────

/// Container sandbox hardening settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory cap per container in MiB.
    pub memory_mb: u32,
    /// CPU quota per container in cores.
    pub cpu_cores: f64,
    /// Pull missing images automatically.
    pub auto_pull: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 0.8,
            auto_pull: true,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for catalogue, wordlists, logs, and audit output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory receiving one decision-log JSONL file per workflow.
    pub audit_dir: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
    /// Tool catalogue JSON file; `None` uses the built-in catalogue.
    pub catalog_file: Option<String>,
    /// Host directory holding the SecLists wordlists.
    pub wordlist_host_root: String,
    /// Mount path wordlist parameters must start with.
    pub wordlist_mount_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            audit_dir: "/var/lib/armitage/audit".to_owned(),
            logs_dir: "/var/log/armitage".to_owned(),
            catalog_file: None,
            wordlist_host_root: "/opt/seclists".to_owned(),
            wordlist_mount_root: "/wordlists".to_owned(),
        }
    }
}

// ── LLM config ──────────────────────────────────────────────────

/// LLM provider configuration for the strategic planner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Anthropic provider; absent means the deterministic fallback only.
    pub anthropic: Option<LlmCloudConfig>,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Max tokens requested per completion.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic: None,
            timeout_secs: 30,
            max_tokens: 4096,
        }
    }
}

/// Cloud LLM provider credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmCloudConfig {
    /// API key.
    pub api_key: String,
    /// Model name.
    pub model: String,
}

// ── Approval config ─────────────────────────────────────────────

/// Human-in-the-loop approval settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Default decision timeout in seconds.
    pub default_timeout_secs: u64,
    /// Escalation targets, tried in order after a timeout.
    pub escalation_targets: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            escalation_targets: vec!["security-lead".to_owned()],
        }
    }
}
