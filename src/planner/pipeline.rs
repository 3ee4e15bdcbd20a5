//! Deterministic post-validation for planner output.
//!
//! The model is a creative proposer, never a final authority: every
//! strategy passes through this pipeline before the tree may adopt it.
//! Stages run in order: safety filter, then per-tool parameter validation,
//! constraint filter, exhaustive expansion, combo synthesis. A safety
//! violation rejects the whole strategy; later stages drop or add
//! individual steps.

use std::collections::HashSet;

use serde_json::Value;

use crate::catalog::ToolCatalog;
use crate::types::{
    AttackStep, Condition, ConditionKind, Constraints, Environment, Finding, NodePriority, Phase,
    Strategy,
};

/// Outcome of running the pipeline over a parsed strategy.
#[derive(Debug)]
pub enum Validated {
    /// The strategy survived; adopt it.
    Adopted {
        /// The validated (and possibly expanded) strategy.
        strategy: Strategy,
        /// Steps dropped by the constraint filter that may be re-offered
        /// through the approval subsystem.
        approval_candidates: Vec<AttackStep>,
    },
    /// A safety violation rejected the whole strategy.
    Rejected {
        /// Why the strategy was rejected.
        reason: String,
    },
}

/// The validation pipeline with its fixed configuration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    wordlist_root: String,
}

impl Pipeline {
    /// Create a pipeline enforcing the given wordlist mount root.
    pub fn new(wordlist_root: impl Into<String>) -> Self {
        Self {
            wordlist_root: wordlist_root.into(),
        }
    }

    /// Run all stages over a strategy.
    ///
    /// `root_target` is the workflow target, used when padding steps have
    /// no discovered asset to point at.
    pub fn validate(
        &self,
        catalog: &ToolCatalog,
        constraints: &Constraints,
        findings: &[Finding],
        root_target: &str,
        mut strategy: Strategy,
    ) -> Validated {
        // Stage 1: safety filter. Any violation rejects everything.
        if let Some(reason) = self.safety_violation(catalog, &strategy) {
            tracing::warn!(%reason, "strategy rejected by safety filter");
            return Validated::Rejected { reason };
        }

        // Stage 2: per-tool parameter validation drops offending steps.
        strategy.recommendations = strategy
            .recommendations
            .into_iter()
            .filter(|step| match self.parameter_error(step) {
                None => true,
                Some(error) => {
                    tracing::warn!(step = %step.id, tool = %step.tool, %error, "dropping step with invalid parameters");
                    false
                }
            })
            .collect();

        // Stage 3: constraint filter.
        let mut approval_candidates = Vec::new();
        let exploit_in_production = strategy.phase == Phase::Exploit
            && constraints.environment == Environment::Production;
        strategy.recommendations.retain(|step| {
            if exploit_in_production {
                return false;
            }
            if constraints.exclude_tests.iter().any(|t| t == &step.tool) {
                tracing::debug!(step = %step.id, tool = %step.tool, "step excluded by constraints");
                return false;
            }
            if step.requires_auth && !constraints.requires_auth {
                approval_candidates.push(step.clone());
                return false;
            }
            true
        });

        // Stages 4 and 5 only grow the set; exploit in production stays empty.
        if !exploit_in_production {
            self.expand(constraints, findings, root_target, &mut strategy);
            self.synthesize_combo(findings, &mut strategy);
        }

        Validated::Adopted {
            strategy,
            approval_candidates,
        }
    }

    /// Stage 1: unknown tool or forbidden substring anywhere in parameters.
    fn safety_violation(&self, catalog: &ToolCatalog, strategy: &Strategy) -> Option<String> {
        for step in &strategy.recommendations {
            if !catalog.contains(&step.tool) {
                return Some(format!("unknown tool '{}'", step.tool));
            }
            let serialized =
                serde_json::to_string(&step.parameters).unwrap_or_else(|_| String::new());
            if let Some(found) = catalog.find_forbidden(Some(&step.tool), &serialized) {
                return Some(format!(
                    "forbidden content '{found}' in parameters of '{}'",
                    step.id
                ));
            }
        }
        None
    }

    /// Stage 2: per-tool parameter rules.
    fn parameter_error(&self, step: &AttackStep) -> Option<String> {
        let target_present = step
            .parameters
            .get("target")
            .is_some_and(|v| !v.is_null());

        match step.tool.as_str() {
            "directory-bruteforce" | "directory-scanner" | "api-discovery" | "api-fuzzer" => {
                if !target_present {
                    return Some("missing required parameter 'target'".to_owned());
                }
                if let Some(Value::String(wordlist)) = step.parameters.get("wordlist") {
                    if !wordlist.starts_with(&self.wordlist_root) {
                        return Some(format!(
                            "wordlist path must begin with '{}'",
                            self.wordlist_root
                        ));
                    }
                }
                None
            }
            "injection-tester" | "port-scanner" | "tech-fingerprint" | "header-analyzer"
            | "ssl-checker" | "subdomain-scanner" => {
                if !target_present {
                    return Some("missing required parameter 'target'".to_owned());
                }
                None
            }
            _ => None,
        }
    }

    /// Stage 4: exhaustive expansion.
    ///
    /// During recon and analyze, every discovered subdomain gets a
    /// directory-bruteforce, a port-scanner, and a tech-fingerprint step.
    /// During analyze, discovered forms, API endpoints, and auth endpoints
    /// get injection, fuzzing, and token-analysis steps. Generic recon
    /// steps pad the set up to the per-phase floor.
    fn expand(
        &self,
        constraints: &Constraints,
        findings: &[Finding],
        root_target: &str,
        strategy: &mut Strategy,
    ) {
        if strategy.phase == Phase::Exploit {
            return;
        }

        let subdomains = subdomain_hosts(findings);
        let mut present: HashSet<(String, String)> = strategy
            .recommendations
            .iter()
            .map(|step| (step.tool.clone(), step_target(step)))
            .collect();
        let mut taken_ids: HashSet<String> = strategy
            .recommendations
            .iter()
            .map(|step| step.id.clone())
            .collect();

        for host in &subdomains {
            for tool in ["directory-bruteforce", "port-scanner", "tech-fingerprint"] {
                let key = (tool.to_owned(), host.clone());
                if present.contains(&key) {
                    continue;
                }
                if constraints.exclude_tests.iter().any(|t| t == tool) {
                    continue;
                }
                let step = coverage_step(&mut taken_ids, tool, host);
                present.insert(key);
                strategy.recommendations.push(step);
            }
        }

        if strategy.phase == Phase::Analyze {
            for finding in findings {
                let follow_up = match finding.kind.as_str() {
                    "form" => Some("injection-tester"),
                    "api-endpoint" => Some("api-fuzzer"),
                    "auth-endpoint" => Some("jwt-analyzer"),
                    _ => None,
                };
                let Some(tool) = follow_up else { continue };
                if constraints.exclude_tests.iter().any(|t| t == tool) {
                    continue;
                }
                let key = (tool.to_owned(), finding.target.clone());
                if present.contains(&key) {
                    continue;
                }
                let step = coverage_step(&mut taken_ids, tool, &finding.target);
                present.insert(key);
                strategy.recommendations.push(step);
            }
        }

        // Floor: max(minTestsPerPhase, assets × 3), padded with generic steps.
        let floor = constraints
            .min_tests_per_phase
            .max(subdomains.len().saturating_mul(3));
        let padding: Vec<&str> = ["header-analyzer", "ssl-checker"]
            .into_iter()
            .filter(|tool| !constraints.exclude_tests.iter().any(|t| t == tool))
            .collect();
        let mut generic_index = 0usize;
        while strategy.recommendations.len() < floor && !padding.is_empty() {
            let tool = padding[generic_index.rem_euclid(padding.len())];
            generic_index = generic_index.saturating_add(1);
            let target = subdomains
                .first()
                .map(String::as_str)
                .unwrap_or(root_target);
            let step = coverage_step(&mut taken_ids, tool, target);
            strategy.recommendations.push(step);
        }
    }

    /// Stage 5: with two or more subdomains, add one cross-target probe.
    fn synthesize_combo(&self, findings: &[Finding], strategy: &mut Strategy) {
        let subdomains = subdomain_hosts(findings);
        let (Some(first), Some(second)) = (subdomains.first(), subdomains.get(1)) else {
            return;
        };
        if strategy
            .recommendations
            .iter()
            .any(|step| step.tool == "ssrf-probe")
        {
            return;
        }

        let mut parameters = serde_json::Map::new();
        parameters.insert("target".to_owned(), Value::String(first.clone()));
        parameters.insert("probe_host".to_owned(), Value::String(second.clone()));

        strategy.recommendations.push(AttackStep {
            id: format!("combo-ssrf-{first}"),
            tool: "ssrf-probe".to_owned(),
            purpose: format!("cross-target request forgery probe pairing {first} and {second}"),
            parameters,
            priority: NodePriority::Medium,
            owasp_category: Some("A10:2021-SSRF".to_owned()),
            safety_checks: vec!["rate-limit".to_owned()],
            requires_auth: false,
            conditions: vec![],
            depends_on: vec![],
            expected_outcome: None,
        });
    }
}

/// Hosts from subdomain findings, deduplicated, in discovery order.
fn subdomain_hosts(findings: &[Finding]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for finding in findings {
        if finding.kind != "subdomain" {
            continue;
        }
        let host = finding
            .data
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or(finding.target.as_str())
            .to_owned();
        if !host.is_empty() && seen.insert(host.clone()) {
            hosts.push(host);
        }
    }
    hosts
}

/// The `target` parameter of a step as a string, empty when absent.
fn step_target(step: &AttackStep) -> String {
    step.parameters
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Build a coverage step with a unique id for a (tool, target) pair.
fn coverage_step(taken_ids: &mut HashSet<String>, tool: &str, target: &str) -> AttackStep {
    let base = format!("{tool}-{}", sanitize_id(target));
    let mut id = base.clone();
    let mut suffix = 1usize;
    while taken_ids.contains(&id) {
        suffix = suffix.saturating_add(1);
        id = format!("{base}-{suffix}");
    }
    taken_ids.insert(id.clone());

    let mut parameters = serde_json::Map::new();
    parameters.insert("target".to_owned(), Value::String(target.to_owned()));

    AttackStep {
        id,
        tool: tool.to_owned(),
        purpose: format!("{tool} coverage for {target}"),
        parameters,
        priority: NodePriority::Medium,
        owasp_category: None,
        safety_checks: vec!["rate-limit".to_owned()],
        requires_auth: false,
        conditions: vec![Condition {
            kind: ConditionKind::FindingExists,
            field: None,
            value: None,
            operator: None,
        }],
        depends_on: vec![],
        expected_outcome: None,
    }
}

/// Lowercase a target into an id-safe fragment.
pub(crate) fn sanitize_id(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
