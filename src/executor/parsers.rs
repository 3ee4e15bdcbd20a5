//! Per-tool output parsers turning raw container output into findings.
//!
//! Parsers are deterministic and forgiving: a tool that prints nothing
//! useful simply yields no findings. Unknown tools get the generic parser
//! so every completed execution leaves at least a trace of its output.

use chrono::Utc;
use regex::Regex;

use crate::types::{Finding, Severity};

/// Head of output preserved by the generic parser.
const GENERIC_HEAD_CHARS: usize = 1024;

/// Parse tool output into findings.
pub fn parse_findings(tool: &str, output: &str, target: &str) -> Vec<Finding> {
    match tool {
        "subdomain-scanner" => parse_subdomains(output),
        "port-scanner" => parse_ports(output, target),
        _ => parse_generic(tool, output, target),
    }
}

/// One finding per non-empty stdout line, skipping error chatter.
fn parse_subdomains(output: &str) -> Vec<Finding> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.to_lowercase().contains("error"))
        .map(|line| Finding {
            kind: "subdomain".to_owned(),
            severity: Severity::Info,
            confidence: 0.95,
            target: line.to_owned(),
            data: serde_json::json!({ "host": line }),
            tool: "subdomain-scanner".to_owned(),
            timestamp: Utc::now(),
        })
        .collect()
}

/// One finding per `port/tcp open service` line.
fn parse_ports(output: &str, target: &str) -> Vec<Finding> {
    let Ok(pattern) = Regex::new(r"(?m)^\s*(\d+)/tcp\s+open\s+(\S+)") else {
        return Vec::new();
    };
    pattern
        .captures_iter(output)
        .filter_map(|caps| {
            let port = caps.get(1)?.as_str();
            let service = caps.get(2)?.as_str();
            Some(Finding {
                kind: "port".to_owned(),
                severity: Severity::Info,
                confidence: 0.9,
                target: target.to_owned(),
                data: serde_json::json!({ "port": port, "service": service }),
                tool: "port-scanner".to_owned(),
                timestamp: Utc::now(),
            })
        })
        .collect()
}

/// Default parser: the head of the output as a single generic finding.
fn parse_generic(tool: &str, output: &str, target: &str) -> Vec<Finding> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let head: String = trimmed.chars().take(GENERIC_HEAD_CHARS).collect();
    vec![Finding {
        kind: "generic".to_owned(),
        severity: Severity::Info,
        confidence: 0.5,
        target: target.to_owned(),
        data: serde_json::json!({ "output": head }),
        tool: tool.to_owned(),
        timestamp: Utc::now(),
    }]
}
