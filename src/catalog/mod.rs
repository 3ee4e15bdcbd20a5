//! Declarative tool catalogue: the registry of executable security tools.
//!
//! Each entry names a container image, the parameters the tool accepts,
//! the argv template used to build its command line, and the safety rails
//! (forbidden flags, timeout ceiling, read-only mounts). The catalogue is
//! read once at startup from a JSON file; when the file is absent a
//! built-in catalogue is used and unknown-parameter rejection is relaxed,
//! but the destructive-verb denylist always applies.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Destructive verbs that must never appear in tool parameters.
pub const DESTRUCTIVE_VERBS: [&str; 5] = ["rm", "delete", "drop", "destroy", "wipe"];

/// Tools that accept an array `target` and are invoked once per element.
pub const MULTI_TARGET_TOOLS: [&str; 6] = [
    "port-scanner",
    "tech-fingerprint",
    "directory-scanner",
    "directory-bruteforce",
    "api-discovery",
    "api-fuzzer",
];

/// How a tool emits results on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Newline-delimited JSON objects.
    Ndjson,
    /// A single JSON document.
    Json,
    /// Free text, handed to the per-tool line parsers.
    #[default]
    Text,
}

/// A bind mount a tool requires, e.g. the wordlist directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path (resolved against config at engine start).
    pub host: String,
    /// Container path.
    pub container: String,
    /// Mount read-only. Wordlist mounts always are.
    #[serde(default = "default_true")]
    pub read_only: bool,
}

fn default_true() -> bool {
    true
}

/// One catalogue entry describing an executable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, unique in the catalogue.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Parameters the tool accepts.
    #[serde(default)]
    pub allowed_params: Vec<String>,
    /// Parameters that must be present (missing ones log a warning).
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Defaults injected when the caller omits a parameter.
    #[serde(default)]
    pub default_params: serde_json::Map<String, serde_json::Value>,
    /// Flags that must never reach the command line.
    #[serde(default)]
    pub forbidden_flags: Vec<String>,
    /// Extra flags permitted beyond those in the argv template.
    #[serde(default)]
    pub allowed_flags: Vec<String>,
    /// Output format expected on stdout.
    #[serde(default)]
    pub output: OutputFormat,
    /// Hard ceiling for a single invocation, in milliseconds.
    pub max_timeout_ms: u64,
    /// Bind mounts the tool needs.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Argv template; `{param}` tokens are substituted from parameters.
    pub argv: Vec<String>,
    /// Tokens appended when not already present after substitution.
    #[serde(default)]
    pub default_args: Vec<String>,
}

impl ToolSpec {
    /// Build the command line for a parameter map.
    ///
    /// `{param}` placeholders are substituted with the parameter's string
    /// form. A token whose placeholder has no value is dropped, together
    /// with an immediately preceding flag token (so `-w {wordlist}`
    /// disappears as a pair when no wordlist was given).
    pub fn build_argv(&self, params: &serde_json::Map<String, serde_json::Value>) -> Vec<String> {
        let mut argv: Vec<String> = Vec::new();
        for token in &self.argv {
            match substitute(token, params) {
                Some(resolved) => argv.push(resolved),
                None => {
                    if argv.last().is_some_and(|prev| prev.starts_with('-')) {
                        argv.pop();
                    }
                }
            }
        }
        for extra in &self.default_args {
            if !argv.iter().any(|t| t == extra) {
                argv.push(extra.clone());
            }
        }
        argv
    }

    /// Flags this tool may legally carry: template flags plus extras.
    pub fn permitted_flags(&self) -> Vec<&str> {
        self.argv
            .iter()
            .chain(self.default_args.iter())
            .chain(self.allowed_flags.iter())
            .map(String::as_str)
            .filter(|t| t.starts_with('-'))
            .collect()
    }
}

/// Substitute `{param}` placeholders in one token.
///
/// Returns `None` when a placeholder has no matching parameter.
fn substitute(
    token: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> Option<String> {
    if !token.contains('{') {
        return Some(token.to_owned());
    }
    let mut out = String::new();
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        let (head, tail) = rest.split_at(open);
        out.push_str(head);
        let close = tail.find('}')?;
        let key = tail.get(1..close)?;
        let value = params.get(key)?;
        out.push_str(&value_to_arg(value));
        rest = tail.get(close.saturating_add(1)..).unwrap_or("");
    }
    out.push_str(rest);
    Some(out)
}

/// Render a JSON parameter value as a single argv token.
fn value_to_arg(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_to_arg)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Catalogue errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalogue file could not be read.
    #[error("failed to read catalogue file: {0}")]
    Io(#[from] std::io::Error),
    /// The catalogue file is not a valid JSON array of entries.
    #[error("failed to parse catalogue file: {0}")]
    Parse(#[from] serde_json::Error),
    /// Two entries share a name.
    #[error("duplicate tool name in catalogue: {0}")]
    Duplicate(String),
}

/// The loaded tool catalogue. Initialised once, read-only thereafter.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    entries: HashMap<String, ToolSpec>,
    /// When true, unknown parameters are tolerated (catalogue file absent).
    permissive: bool,
}

impl ToolCatalog {
    /// Load the catalogue from a JSON file.
    ///
    /// An absent file falls back to [`ToolCatalog::builtin`] in permissive
    /// mode: unknown parameters are not rejected, but the destructive-verb
    /// denylist still applies.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "catalogue file absent, using built-in set");
                return Ok(Self::builtin());
            }
            Err(e) => return Err(CatalogError::Io(e)),
        };
        let specs: Vec<ToolSpec> = serde_json::from_str(&contents)?;
        let mut entries = HashMap::new();
        for spec in specs {
            if entries.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(CatalogError::Duplicate(spec.name));
            }
        }
        tracing::info!(tools = entries.len(), path = %path.display(), "tool catalogue loaded");
        Ok(Self {
            entries,
            permissive: false,
        })
    }

    /// The built-in catalogue covering the standard tool set.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        for spec in builtin_specs() {
            entries.insert(spec.name.clone(), spec);
        }
        Self {
            entries,
            permissive: true,
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.entries.get(name)
    }

    /// Whether a tool exists in the catalogue.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All tool names, sorted for stable prompt assembly.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether unknown-parameter rejection is disabled.
    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    /// Whether the tool fans out over an array `target`.
    pub fn is_multi_target(tool: &str) -> bool {
        MULTI_TARGET_TOOLS.contains(&tool)
    }

    /// Scan serialized parameters for denylisted content.
    ///
    /// Checks the global destructive verbs (word-boundary match, so
    /// `--format` is not flagged for containing `rm`) and, when the tool
    /// is known, its forbidden flags as plain substrings.
    pub fn find_forbidden(&self, tool: Option<&str>, serialized: &str) -> Option<String> {
        let lowered = serialized.to_lowercase();
        for verb in DESTRUCTIVE_VERBS {
            if contains_word(&lowered, verb) {
                return Some(verb.to_owned());
            }
        }
        if let Some(spec) = tool.and_then(|name| self.entries.get(name)) {
            for flag in &spec.forbidden_flags {
                if lowered.contains(&flag.to_lowercase()) {
                    return Some(flag.clone());
                }
            }
        }
        None
    }
}

/// Word-boundary containment check without a regex allocation per call.
fn contains_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack.get(start..).and_then(|h| h.find(needle)) {
        let abs = start.saturating_add(pos);
        let end = abs.saturating_add(needle.len());
        let before_ok = abs == 0
            || haystack
                .get(..abs)
                .and_then(|s| s.chars().last())
                .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack
            .get(end..)
            .and_then(|s| s.chars().next())
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs.saturating_add(1);
    }
    false
}

/// The built-in tool set.
fn builtin_specs() -> Vec<ToolSpec> {
    let wordlist_mount = MountSpec {
        host: "/opt/seclists".to_owned(),
        container: "/wordlists".to_owned(),
        read_only: true,
    };

    vec![
        ToolSpec {
            name: "subdomain-scanner".to_owned(),
            image: "projectdiscovery/subfinder:latest".to_owned(),
            allowed_params: vec!["target".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec![],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 300_000,
            mounts: vec![],
            argv: vec!["-d".to_owned(), "{target}".to_owned()],
            default_args: vec!["-silent".to_owned()],
        },
        ToolSpec {
            name: "port-scanner".to_owned(),
            image: "instrumentisto/nmap:latest".to_owned(),
            allowed_params: vec!["target".to_owned(), "ports".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: map(&[("ports", serde_json::json!("1000"))]),
            forbidden_flags: vec!["--script".to_owned(), "-oA".to_owned()],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 600_000,
            mounts: vec![],
            argv: vec![
                "-Pn".to_owned(),
                "--top-ports".to_owned(),
                "{ports}".to_owned(),
                "{target}".to_owned(),
            ],
            default_args: vec![],
        },
        ToolSpec {
            name: "directory-bruteforce".to_owned(),
            image: "ghcr.io/oj/gobuster:latest".to_owned(),
            allowed_params: vec![
                "target".to_owned(),
                "wordlist".to_owned(),
                "extensions".to_owned(),
                "rate_limit".to_owned(),
            ],
            required_params: vec!["target".to_owned()],
            default_params: map(&[(
                "wordlist",
                serde_json::json!("/wordlists/Discovery/Web-Content/common.txt"),
            )]),
            forbidden_flags: vec![],
            allowed_flags: vec!["--delay".to_owned()],
            output: OutputFormat::Text,
            max_timeout_ms: 900_000,
            mounts: vec![wordlist_mount.clone()],
            argv: vec![
                "dir".to_owned(),
                "-u".to_owned(),
                "{target}".to_owned(),
                "-w".to_owned(),
                "{wordlist}".to_owned(),
                "-x".to_owned(),
                "{extensions}".to_owned(),
            ],
            default_args: vec!["-q".to_owned()],
        },
        ToolSpec {
            name: "directory-scanner".to_owned(),
            image: "ffuf/ffuf:latest".to_owned(),
            allowed_params: vec![
                "target".to_owned(),
                "wordlist".to_owned(),
                "rate_limit".to_owned(),
            ],
            required_params: vec!["target".to_owned()],
            default_params: map(&[(
                "wordlist",
                serde_json::json!("/wordlists/Discovery/Web-Content/common.txt"),
            )]),
            forbidden_flags: vec![],
            allowed_flags: vec!["-rate".to_owned()],
            output: OutputFormat::Json,
            max_timeout_ms: 900_000,
            mounts: vec![wordlist_mount.clone()],
            argv: vec![
                "-u".to_owned(),
                "{target}/FUZZ".to_owned(),
                "-w".to_owned(),
                "{wordlist}".to_owned(),
            ],
            default_args: vec!["-s".to_owned()],
        },
        ToolSpec {
            name: "tech-fingerprint".to_owned(),
            image: "projectdiscovery/httpx:latest".to_owned(),
            allowed_params: vec!["target".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec![],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 300_000,
            mounts: vec![],
            argv: vec!["-u".to_owned(), "{target}".to_owned()],
            default_args: vec!["-tech-detect".to_owned(), "-silent".to_owned()],
        },
        ToolSpec {
            name: "header-analyzer".to_owned(),
            image: "curlimages/curl:latest".to_owned(),
            allowed_params: vec!["target".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec![],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 120_000,
            mounts: vec![],
            argv: vec!["-sI".to_owned(), "{target}".to_owned()],
            default_args: vec![],
        },
        ToolSpec {
            name: "ssl-checker".to_owned(),
            image: "drwetter/testssl.sh:latest".to_owned(),
            allowed_params: vec!["target".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec![],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 600_000,
            mounts: vec![],
            argv: vec!["--quiet".to_owned(), "{target}".to_owned()],
            default_args: vec![],
        },
        ToolSpec {
            name: "injection-tester".to_owned(),
            image: "parrotsec/sqlmap:latest".to_owned(),
            allowed_params: vec!["target".to_owned(), "level".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: map(&[("level", serde_json::json!("1"))]),
            forbidden_flags: vec!["--os-shell".to_owned(), "--os-cmd".to_owned()],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 900_000,
            mounts: vec![],
            argv: vec![
                "-u".to_owned(),
                "{target}".to_owned(),
                "--level".to_owned(),
                "{level}".to_owned(),
            ],
            default_args: vec!["--batch".to_owned()],
        },
        ToolSpec {
            name: "api-discovery".to_owned(),
            image: "ffuf/ffuf:latest".to_owned(),
            allowed_params: vec![
                "target".to_owned(),
                "wordlist".to_owned(),
                "rate_limit".to_owned(),
            ],
            required_params: vec!["target".to_owned()],
            default_params: map(&[(
                "wordlist",
                serde_json::json!("/wordlists/Discovery/Web-Content/api/objects.txt"),
            )]),
            forbidden_flags: vec![],
            allowed_flags: vec!["-rate".to_owned()],
            output: OutputFormat::Json,
            max_timeout_ms: 600_000,
            mounts: vec![wordlist_mount.clone()],
            argv: vec![
                "-u".to_owned(),
                "{target}/FUZZ".to_owned(),
                "-w".to_owned(),
                "{wordlist}".to_owned(),
            ],
            default_args: vec!["-s".to_owned()],
        },
        ToolSpec {
            name: "api-fuzzer".to_owned(),
            image: "ffuf/ffuf:latest".to_owned(),
            allowed_params: vec![
                "target".to_owned(),
                "wordlist".to_owned(),
                "method".to_owned(),
                "rate_limit".to_owned(),
            ],
            required_params: vec!["target".to_owned()],
            default_params: map(&[("method", serde_json::json!("GET"))]),
            forbidden_flags: vec![],
            allowed_flags: vec!["-rate".to_owned()],
            output: OutputFormat::Json,
            max_timeout_ms: 600_000,
            mounts: vec![wordlist_mount],
            argv: vec![
                "-u".to_owned(),
                "{target}".to_owned(),
                "-X".to_owned(),
                "{method}".to_owned(),
                "-w".to_owned(),
                "{wordlist}".to_owned(),
            ],
            default_args: vec!["-s".to_owned()],
        },
        ToolSpec {
            name: "jwt-analyzer".to_owned(),
            image: "ticarpi/jwt_tool:latest".to_owned(),
            allowed_params: vec!["target".to_owned(), "token".to_owned()],
            required_params: vec!["target".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec!["-X".to_owned()],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 300_000,
            mounts: vec![],
            argv: vec!["-t".to_owned(), "{target}".to_owned()],
            default_args: vec![],
        },
        ToolSpec {
            name: "ssrf-probe".to_owned(),
            image: "curlimages/curl:latest".to_owned(),
            allowed_params: vec!["target".to_owned(), "probe_host".to_owned()],
            required_params: vec!["target".to_owned(), "probe_host".to_owned()],
            default_params: serde_json::Map::new(),
            forbidden_flags: vec![],
            allowed_flags: vec![],
            output: OutputFormat::Text,
            max_timeout_ms: 120_000,
            mounts: vec![],
            argv: vec![
                "-s".to_owned(),
                "{target}".to_owned(),
                "-H".to_owned(),
                "X-Forwarded-Host: {probe_host}".to_owned(),
            ],
            default_args: vec![],
        },
    ]
}

fn map(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}
