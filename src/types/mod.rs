//! Core domain model: workflows, phases, findings, test nodes, strategies.
//!
//! Everything that crosses a component boundary lives here so the
//! orchestrator, planner, tree executor, and execution engine agree on
//! one vocabulary. Types that are parsed from or serialized to the LLM
//! collaborator use camelCase field names to match its JSON output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque workflow identifier, stable for the life of a run.
pub type WorkflowId = Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    /// Created, not yet started.
    Pending,
    /// Phase driver is running.
    Running,
    /// Blocked on at least one human approval.
    AwaitingApproval,
    /// All phases finished (possibly truncated by the deadline).
    Completed,
    /// Fatal internal error.
    Failed,
    /// Cooperatively cancelled.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Deployment environment of the target, used by restraint rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development target; the most permissive policy tier.
    #[default]
    Development,
    /// Staging target.
    Staging,
    /// Production target; exploit-phase steps are dropped or gated.
    Production,
}

/// Caller-supplied constraints bounding a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constraints {
    /// Target environment; affects restraint policy.
    pub environment: Environment,
    /// Ordered host/path patterns limiting which targets may be tested.
    pub scope: Vec<String>,
    /// Wall-clock budget in milliseconds. `None` means unbounded.
    pub time_limit: Option<u64>,
    /// Floor for the planner's exhaustive expansion per phase.
    pub min_tests_per_phase: usize,
    /// Tool names that must never be scheduled.
    pub exclude_tests: Vec<String>,
    /// Caller asserts authenticated testing is allowed.
    pub requires_auth: bool,
    /// Allow wordlist-based scans against the SecLists mount.
    pub use_seclists_wordlists: bool,
}

impl Constraints {
    /// Whether a host or URL falls inside the declared scope.
    ///
    /// An empty scope admits everything; otherwise the first matching
    /// pattern wins, where a pattern matches by substring.
    pub fn in_scope(&self, target: &str) -> bool {
        if self.scope.is_empty() {
            return true;
        }
        self.scope.iter().any(|pattern| target.contains(pattern))
    }
}

/// A complete workflow record owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable identifier for this run.
    pub id: WorkflowId,
    /// Target URL or host under test.
    pub target: String,
    /// Free-text user intent.
    pub intent: String,
    /// Caller constraints.
    pub constraints: Constraints,
    /// Phase currently (or last) driven.
    pub phase: Phase,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// Terminal time, once reached.
    pub ended_at: Option<DateTime<Utc>>,
    /// Aggregated findings, append-only.
    pub findings: Vec<Finding>,
    /// Per-phase summaries in execution order.
    pub phases: Vec<PhaseRecord>,
    /// Set when the workflow deadline fired before all phases finished.
    pub truncated: bool,
    /// Fatal error detail when status is `Failed`.
    pub error: Option<String>,
}

impl Workflow {
    /// Create a pending workflow at submission time.
    pub fn new(target: String, intent: String, constraints: Constraints) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            intent,
            constraints,
            phase: Phase::Recon,
            status: WorkflowStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            findings: Vec::new(),
            phases: Vec::new(),
            truncated: false,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Progressive discovery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Asset and surface discovery.
    Recon,
    /// Deeper inspection of discovered assets.
    Analyze,
    /// Active verification of suspected weaknesses.
    Exploit,
}

impl Phase {
    /// The phase that follows this one, or `None` after exploit.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Recon => Some(Self::Analyze),
            Self::Analyze => Some(Self::Exploit),
            Self::Exploit => None,
        }
    }

    /// Stable lowercase name used in prompts and events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Analyze => "analyze",
            Self::Exploit => "exploit",
        }
    }
}

/// Summary of one executed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Which phase this record covers.
    pub phase: Phase,
    /// Phase start time.
    pub started_at: DateTime<Utc>,
    /// Phase end time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Planner reasoning adopted for the phase.
    pub reasoning: String,
    /// Results of every node executed in the phase.
    pub results: Vec<NodeResult>,
    /// Finding counts for the phase.
    pub summary: FindingSummary,
    /// Whether the discovery machine decided to advance.
    pub proceed: bool,
}

/// Finding counts, total and by severity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingSummary {
    /// Total findings produced in scope.
    pub total: usize,
    /// Count per severity name.
    pub by_severity: BTreeMap<String, usize>,
}

impl FindingSummary {
    /// Tally a slice of findings.
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        for finding in findings {
            let slot = by_severity
                .entry(finding.severity.as_str().to_owned())
                .or_insert(0);
            *slot = slot.saturating_add(1);
        }
        Self {
            total: findings.len(),
            by_severity,
        }
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// Severity scale for findings and approval contexts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational observation.
    #[default]
    Info,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A structured observation produced by a tool output parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Finding kind, e.g. "subdomain", "port", "tech", "vulnerability".
    #[serde(rename = "type")]
    pub kind: String,
    /// Assessed severity.
    pub severity: Severity,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Host or URL the finding applies to.
    pub target: String,
    /// Tool-specific key/value payload.
    pub data: serde_json::Value,
    /// Producing tool name.
    pub tool: String,
    /// When the finding was parsed.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Test nodes
// ---------------------------------------------------------------------------

/// Status of a node in the test tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting on dependencies, conditions, or a dispatch slot.
    Pending,
    /// Dispatched to the execution engine.
    Running,
    /// Executed successfully.
    Completed,
    /// Skipped by restraint, condition, decision hook, or cancellation.
    Skipped,
    /// Executed and failed (retries exhausted).
    Failed,
}

/// Scheduling priority of a test node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePriority {
    /// Must-run node; retried most aggressively.
    Critical,
    /// Important node.
    High,
    /// Default priority.
    #[default]
    Medium,
    /// Opportunistic node.
    Low,
}

impl NodePriority {
    /// Retry budget implied by the priority: 3 for critical, 1 otherwise.
    pub fn default_max_retries(self) -> u32 {
        match self {
            Self::Critical => 3,
            _ => 1,
        }
    }
}

/// Operator applied by `finding_matches` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Strict equality on the JSON value.
    Equals,
    /// Substring match on string coercion.
    Contains,
    /// Numeric greater-than on numeric coercion.
    GreaterThan,
    /// Field is present.
    Exists,
    /// Field is absent.
    NotExists,
}

/// Kind of predicate gating a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Any prior result carries a non-empty findings list.
    FindingExists,
    /// Some finding field satisfies the operator against `value`.
    FindingMatches,
    /// The result for node `value` is absent or has no findings.
    NoFindings,
    /// Evaluated by the decision hook; passes by default.
    Custom,
}

/// A predicate evaluated against accumulated results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Predicate kind.
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Finding field inspected by `finding_matches`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Comparison value; for `no_findings` the node id to inspect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Comparison operator for `finding_matches`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<ConditionOperator>,
}

/// Result of one node execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    /// Node that produced this result.
    pub node_id: String,
    /// Tool that ran.
    pub tool: String,
    /// Terminal status of the attempt.
    pub status: NodeStatus,
    /// Findings parsed from the tool output.
    pub findings: Vec<Finding>,
    /// Raw captured output (bounded by the engine).
    pub output: String,
    /// Error or skip reason, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// A planned or executed tool invocation; node in the dynamic test tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    /// Unique id within the workflow.
    pub id: String,
    /// Parent node id, absent for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Catalogue tool name.
    pub tool: String,
    /// Human-readable purpose.
    pub purpose: String,
    /// Tool parameters.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Node ids that must be completed before this node runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Conditions that must all hold before this node runs.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Child node ids.
    #[serde(default)]
    pub children: Vec<String>,
    /// Current status.
    pub status: NodeStatus,
    /// Result of the last attempt, once any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NodeResult>,
    /// Dispatch time of the current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Scheduling priority.
    pub priority: NodePriority,
    /// OWASP category tag, when the planner assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp_category: Option<String>,
    /// Safety-check tags driving parameter mitigations.
    #[serde(default)]
    pub safety_checks: Vec<String>,
    /// Attempts consumed so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
}

impl TestNode {
    /// Safety tag marking a node that needs the authenticated-testing gate.
    pub const REQUIRES_AUTH_TAG: &'static str = "requires-auth";

    /// Build a node from a validated planner attack step.
    ///
    /// A step asserting `requires_auth` is tagged so the restraint layer
    /// can gate it even after the flag itself is gone.
    pub fn from_step(step: AttackStep) -> Self {
        let max_retries = step.priority.default_max_retries();
        let mut safety_checks = step.safety_checks;
        if step.requires_auth
            && !safety_checks.iter().any(|t| t == Self::REQUIRES_AUTH_TAG)
        {
            safety_checks.push(Self::REQUIRES_AUTH_TAG.to_owned());
        }
        Self {
            id: step.id,
            parent: None,
            tool: step.tool,
            purpose: step.purpose,
            parameters: step.parameters,
            dependencies: step.depends_on,
            conditions: step.conditions,
            children: Vec::new(),
            status: NodeStatus::Pending,
            result: None,
            started_at: None,
            ended_at: None,
            priority: step.priority,
            owasp_category: step.owasp_category,
            safety_checks,
            retry_count: 0,
            max_retries,
        }
    }
}

// ---------------------------------------------------------------------------
// Planner output
// ---------------------------------------------------------------------------

/// A candidate test node proposed by the planner, before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackStep {
    /// Proposed node id, unique within the strategy.
    pub id: String,
    /// Catalogue tool name.
    pub tool: String,
    /// What the step is meant to establish.
    #[serde(default)]
    pub purpose: String,
    /// Tool parameters.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: NodePriority,
    /// OWASP category tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp_category: Option<String>,
    /// Safety-check tags.
    #[serde(default)]
    pub safety_checks: Vec<String>,
    /// Whether the step needs authenticated access.
    #[serde(default)]
    pub requires_auth: bool,
    /// Conditions gating the step.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Node ids this step depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-text outcome the planner expects; never auto-expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

/// A conditional branch template the planner anticipates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedOutcome {
    /// Condition under which the branch applies.
    pub condition: String,
    /// Suggested follow-up tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then_tool: Option<String>,
    /// Narrative description.
    #[serde(default)]
    pub description: String,
}

/// The planner's structured output for one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Phase the strategy targets.
    pub phase: Phase,
    /// Planner reasoning.
    pub reasoning: String,
    /// Ordered attack steps.
    #[serde(default)]
    pub recommendations: Vec<AttackStep>,
    /// Planner confidence in [0, 1].
    pub confidence_level: f64,
    /// Anticipated conditional branches.
    #[serde(default)]
    pub expected_outcomes: Vec<ExpectedOutcome>,
    /// Conditions under which the next phase should start.
    #[serde(default)]
    pub next_phase_conditions: Vec<String>,
    /// Estimated duration in minutes.
    pub estimated_duration_mins: u64,
    /// Safety considerations carried into execution.
    #[serde(default)]
    pub safety_considerations: Vec<String>,
}
