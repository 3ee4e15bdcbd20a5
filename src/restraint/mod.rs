//! Restraint layer: deterministic policy evaluation before any execution.
//!
//! Every candidate test passes through an ordered rule set keyed by tool,
//! environment, target pattern, and parameter shape. A rule either stays
//! silent or rules: approve-with-mitigations, deny, or require-approval.
//! The first ruling wins; a silent pass through every rule approves.

use serde_json::Value;

use crate::types::{Constraints, Environment, NodePriority, Severity, TestNode};

/// Tools that perform active probing beyond passive observation.
const ACTIVE_TOOLS: [&str; 4] = ["api-fuzzer", "jwt-analyzer", "ssrf-probe", "directory-bruteforce"];

/// Tools whose scans are driven by a wordlist.
const WORDLIST_TOOLS: [&str; 4] = [
    "directory-bruteforce",
    "directory-scanner",
    "api-discovery",
    "api-fuzzer",
];

/// A candidate test about to be dispatched.
#[derive(Debug, Clone)]
pub struct CandidateTest<'a> {
    /// Catalogue tool name.
    pub tool: &'a str,
    /// Target host or URL.
    pub target: &'a str,
    /// Proposed parameters.
    pub parameters: &'a serde_json::Map<String, Value>,
    /// Scheduling priority.
    pub priority: NodePriority,
    /// Safety tags carried from the planner.
    pub safety_checks: &'a [String],
}

/// The ruling produced by restraint evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestraintDecision {
    /// Execute as requested.
    Approve,
    /// Execute with these parameters merged in.
    ApproveWithMitigations(serde_json::Map<String, Value>),
    /// Do not execute; the node is skipped with this reason.
    Deny {
        /// Why the test was denied.
        reason: String,
    },
    /// Execution is gated on a human decision.
    RequireApproval {
        /// How urgent the approval is.
        severity: Severity,
        /// Why an approval is needed.
        reason: String,
    },
}

impl RestraintDecision {
    /// Whether this decision lets execution proceed immediately.
    pub fn allows_execution(&self) -> bool {
        matches!(self, Self::Approve | Self::ApproveWithMitigations(_))
    }
}

/// One named rule. Returns `None` to stay silent.
type RuleFn = fn(&CandidateTest<'_>, &Constraints) -> Option<RestraintDecision>;

struct Rule {
    name: &'static str,
    check: RuleFn,
}

/// Ordered deterministic rule set.
pub struct RestraintEngine {
    rules: Vec<Rule>,
}

impl RestraintEngine {
    /// The default rule set, most restrictive rules first.
    pub fn with_defaults() -> Self {
        Self {
            rules: vec![
                Rule {
                    name: "scope-guard",
                    check: scope_guard,
                },
                Rule {
                    name: "excluded-tools",
                    check: excluded_tools,
                },
                Rule {
                    name: "wordlist-policy",
                    check: wordlist_policy,
                },
                Rule {
                    name: "production-injection-guard",
                    check: production_injection_guard,
                },
                Rule {
                    name: "auth-gate",
                    check: auth_gate,
                },
                Rule {
                    name: "production-active-tools",
                    check: production_active_tools,
                },
                Rule {
                    name: "bruteforce-mitigations",
                    check: bruteforce_mitigations,
                },
            ],
        }
    }

    /// Evaluate a candidate. The first rule that rules, wins.
    pub fn evaluate(
        &self,
        candidate: &CandidateTest<'_>,
        constraints: &Constraints,
    ) -> RestraintDecision {
        for rule in &self.rules {
            if let Some(decision) = (rule.check)(candidate, constraints) {
                tracing::debug!(
                    rule = rule.name,
                    tool = candidate.tool,
                    target = candidate.target,
                    decision = ?decision,
                    "restraint rule fired"
                );
                return decision;
            }
        }
        RestraintDecision::Approve
    }
}

// ── Rules, in declared order ────────────────────────────────────

/// Targets outside the declared scope are never tested.
fn scope_guard(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    if candidate.target.is_empty() || constraints.in_scope(candidate.target) {
        return None;
    }
    Some(RestraintDecision::Deny {
        reason: format!("target '{}' is outside the declared scope", candidate.target),
    })
}

/// Tools the caller explicitly forbade.
fn excluded_tools(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    if constraints.exclude_tests.iter().any(|t| t == candidate.tool) {
        return Some(RestraintDecision::Deny {
            reason: format!("tool '{}' excluded by constraints", candidate.tool),
        });
    }
    None
}

/// Wordlist-driven scans need the caller's opt-in.
fn wordlist_policy(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    if constraints.use_seclists_wordlists {
        return None;
    }
    let uses_wordlist = WORDLIST_TOOLS.contains(&candidate.tool)
        || candidate.parameters.contains_key("wordlist");
    if uses_wordlist {
        return Some(RestraintDecision::Deny {
            reason: "wordlist-based scanning not enabled for this workflow".to_owned(),
        });
    }
    None
}

/// Injection testing never runs against production.
fn production_injection_guard(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    if constraints.environment == Environment::Production && candidate.tool == "injection-tester" {
        return Some(RestraintDecision::Deny {
            reason: "injection testing is not permitted against production".to_owned(),
        });
    }
    None
}

/// Tests needing authenticated access are gated when the caller has not
/// asserted that authenticated testing is allowed.
fn auth_gate(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    let tagged = candidate
        .safety_checks
        .iter()
        .any(|t| t == TestNode::REQUIRES_AUTH_TAG);
    if tagged && !constraints.requires_auth {
        return Some(RestraintDecision::RequireApproval {
            severity: Severity::High,
            reason: "step requires authenticated testing, not asserted by caller".to_owned(),
        });
    }
    None
}

/// Active probing of production needs a human sign-off.
fn production_active_tools(
    candidate: &CandidateTest<'_>,
    constraints: &Constraints,
) -> Option<RestraintDecision> {
    if constraints.environment != Environment::Production {
        return None;
    }
    if ACTIVE_TOOLS.contains(&candidate.tool) || candidate.priority == NodePriority::Critical {
        return Some(RestraintDecision::RequireApproval {
            severity: Severity::Medium,
            reason: format!(
                "active test '{}' against a production target",
                candidate.tool
            ),
        });
    }
    None
}

/// Bruteforce-class tools always run rate limited.
fn bruteforce_mitigations(
    candidate: &CandidateTest<'_>,
    _constraints: &Constraints,
) -> Option<RestraintDecision> {
    if !WORDLIST_TOOLS.contains(&candidate.tool) {
        return None;
    }
    if candidate.parameters.contains_key("rate_limit") {
        return None;
    }
    let mut mitigations = serde_json::Map::new();
    mitigations.insert("rate_limit".to_owned(), Value::String("50".to_owned()));
    Some(RestraintDecision::ApproveWithMitigations(mitigations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target: &str) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("target".to_owned(), Value::String(target.to_owned()));
        map
    }

    fn permissive_constraints() -> Constraints {
        Constraints {
            use_seclists_wordlists: true,
            ..Constraints::default()
        }
    }

    #[test]
    fn test_default_is_approve() {
        let engine = RestraintEngine::with_defaults();
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "header-analyzer",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert_eq!(
            engine.evaluate(&candidate, &permissive_constraints()),
            RestraintDecision::Approve
        );
    }

    #[test]
    fn test_out_of_scope_denied() {
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            scope: vec!["example.test".to_owned()],
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://other.invalid");
        let candidate = CandidateTest {
            tool: "header-analyzer",
            target: "https://other.invalid",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::Deny { reason } if reason.contains("scope")
        ));
    }

    #[test]
    fn test_excluded_tool_denied() {
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            exclude_tests: vec!["port-scanner".to_owned()],
            ..Constraints::default()
        };
        let parameters = params("example.test");
        let candidate = CandidateTest {
            tool: "port-scanner",
            target: "example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::Deny { reason } if reason.contains("excluded")
        ));
    }

    #[test]
    fn test_wordlist_scans_denied_without_opt_in() {
        let engine = RestraintEngine::with_defaults();
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "directory-bruteforce",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &Constraints::default()),
            RestraintDecision::Deny { reason } if reason.contains("wordlist")
        ));
    }

    #[test]
    fn test_injection_in_production_denied() {
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            environment: Environment::Production,
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "injection-tester",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::High,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::Deny { reason } if reason.contains("production")
        ));
    }

    #[test]
    fn test_auth_gate_requires_approval() {
        // requiresAuth asserted by the step, not by the caller.
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            environment: Environment::Production,
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://example.test");
        let tags = vec![TestNode::REQUIRES_AUTH_TAG.to_owned()];
        let candidate = CandidateTest {
            tool: "header-analyzer",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &tags,
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::RequireApproval {
                severity: Severity::High,
                ..
            }
        ));
    }

    #[test]
    fn test_auth_gate_silent_when_caller_asserts_auth() {
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            requires_auth: true,
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://example.test");
        let tags = vec![TestNode::REQUIRES_AUTH_TAG.to_owned()];
        let candidate = CandidateTest {
            tool: "header-analyzer",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &tags,
        };
        assert_eq!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::Approve
        );
    }

    #[test]
    fn test_production_active_tool_requires_approval() {
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            environment: Environment::Production,
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "ssrf-probe",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::RequireApproval { .. }
        ));
    }

    #[test]
    fn test_bruteforce_gets_rate_limit_mitigation() {
        let engine = RestraintEngine::with_defaults();
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "directory-bruteforce",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        match engine.evaluate(&candidate, &permissive_constraints()) {
            RestraintDecision::ApproveWithMitigations(mitigations) => {
                assert_eq!(
                    mitigations.get("rate_limit"),
                    Some(&Value::String("50".to_owned()))
                );
            }
            other => panic!("expected mitigations, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_limited_request_not_mitigated_again() {
        let engine = RestraintEngine::with_defaults();
        let mut parameters = params("https://example.test");
        parameters.insert("rate_limit".to_owned(), Value::String("10".to_owned()));
        let candidate = CandidateTest {
            tool: "directory-bruteforce",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert_eq!(
            engine.evaluate(&candidate, &permissive_constraints()),
            RestraintDecision::Approve
        );
    }

    #[test]
    fn test_rule_order_deny_beats_mitigation() {
        // A bruteforce tool in an excluded list must deny, not mitigate.
        let engine = RestraintEngine::with_defaults();
        let constraints = Constraints {
            exclude_tests: vec!["directory-bruteforce".to_owned()],
            use_seclists_wordlists: true,
            ..Constraints::default()
        };
        let parameters = params("https://example.test");
        let candidate = CandidateTest {
            tool: "directory-bruteforce",
            target: "https://example.test",
            parameters: &parameters,
            priority: NodePriority::Medium,
            safety_checks: &[],
        };
        assert!(matches!(
            engine.evaluate(&candidate, &constraints),
            RestraintDecision::Deny { .. }
        ));
    }
}
