//! Strategic planner: proposes and validates attack steps per phase.
//!
//! The planner assembles a prompt from the strategy context, asks the LLM
//! collaborator for a strategy, parses the JSON response (tolerating
//! fenced blocks and missing fields), and runs the deterministic
//! post-validation pipeline. Provider failures, unparseable output, and
//! safety violations all degrade to a deterministic per-phase fallback so
//! a workflow never stalls on the model.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::audit::{DecisionEntry, DecisionLog, DecisionMetadata, DecisionOutput, DecisionType};
use crate::catalog::ToolCatalog;
use crate::providers::{CompletionRequest, LlmProvider, ProviderError};
use crate::types::{
    AttackStep, Condition, ConditionKind, Constraints, Finding, NodePriority, NodeResult, Phase,
    Strategy, TestNode, WorkflowId,
};

pub mod pipeline;

use pipeline::{Pipeline, Validated};

/// Confidence recorded for recon/analyze fallbacks.
const FALLBACK_CONFIDENCE: f64 = 0.5;
/// Confidence recorded for the exploit fallback.
const FALLBACK_CONFIDENCE_EXPLOIT: f64 = 0.3;
/// Confidence assumed when the model omits one.
const DEFAULT_CONFIDENCE: f64 = 0.7;
/// Estimated duration assumed when the model omits one.
const DEFAULT_DURATION_MINS: u64 = 30;
/// Safety consideration injected when the model offers none.
const DEFAULT_SAFETY_CONSIDERATION: &str = "rate limit all requests";

/// System prompt framing sent with every planning call.
const PLANNER_SYSTEM_PROMPT: &str = "\
You are the strategic planner of a security-testing orchestrator. You \
receive a target, the user's intent, accumulated findings, and the \
catalogue of available tools. Propose the next set of test steps.

Rules:
1. Only recommend tools from the provided catalogue.
2. Never propose destructive actions. Parameters must not contain \
shell commands or data-removal verbs.
3. Wordlist paths must stay under the wordlist mount root.
4. Respond with a single JSON object; a fenced ```json block is fine.

Output schema:
{
  \"phase\": \"recon|analyze|exploit\",
  \"reasoning\": \"...\",
  \"recommendations\": [
    {
      \"id\": \"unique-step-id\",
      \"tool\": \"tool-name\",
      \"purpose\": \"...\",
      \"parameters\": { \"target\": \"...\" },
      \"priority\": \"critical|high|medium|low\",
      \"owaspCategory\": \"optional\",
      \"requiresAuth\": false,
      \"dependsOn\": [],
      \"conditions\": []
    }
  ],
  \"confidenceLevel\": 0.0,
  \"expectedOutcomes\": [],
  \"nextPhaseConditions\": [],
  \"estimatedDurationMins\": 30,
  \"safetyConsiderations\": []
}";

/// Everything the planner needs to reason about one phase.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Root target under test.
    pub target: String,
    /// Free-text user intent.
    pub user_intent: String,
    /// Findings accumulated so far.
    pub current_findings: Vec<Finding>,
    /// Results of tests already executed.
    pub completed_tests: Vec<NodeResult>,
    /// Phase being planned.
    pub phase: Phase,
    /// Workflow constraints.
    pub constraints: Constraints,
}

/// What the planner produced for a phase, and how.
#[derive(Debug)]
pub struct PlanOutcome {
    /// The validated strategy.
    pub strategy: Strategy,
    /// Whether the deterministic fallback replaced the model's output.
    pub fell_back: bool,
    /// Steps held back for the approval subsystem.
    pub approval_candidates: Vec<AttackStep>,
}

/// Decision-hook ruling for a node about to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeDecision {
    /// Run the node.
    Execute,
    /// Skip the node with a reason.
    Skip(String),
    /// Insert these child nodes first, then re-evaluate the node.
    AddChildren(Vec<AttackStep>),
}

/// Planner errors. Callers rarely see these: [`Planner::plan`] degrades
/// to the fallback instead of propagating.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// No JSON object could be extracted from the model response.
    #[error("failed to parse strategy from response: {0}")]
    InvalidFormat(String),
    /// The provider call failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    /// The provider call exceeded the configured timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Strategic planner over an optional LLM provider.
pub struct Planner {
    provider: Option<Arc<dyn LlmProvider>>,
    catalog: Arc<ToolCatalog>,
    pipeline: Pipeline,
    log: Arc<DecisionLog>,
    call_timeout: Duration,
    max_tokens: u32,
}

impl Planner {
    /// Create a planner.
    ///
    /// Without a provider every plan is the deterministic fallback, which
    /// keeps the orchestrator usable in offline and test deployments.
    pub fn new(
        provider: Option<Arc<dyn LlmProvider>>,
        catalog: Arc<ToolCatalog>,
        wordlist_root: impl Into<String>,
        log: Arc<DecisionLog>,
        call_timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        Self {
            provider,
            catalog,
            pipeline: Pipeline::new(wordlist_root),
            log,
            call_timeout,
            max_tokens,
        }
    }

    /// Produce a validated strategy for the context's phase.
    ///
    /// Never fails: provider errors, unparseable output, and safety
    /// rejections all yield the deterministic fallback.
    pub async fn plan(&self, ctx: &StrategyContext) -> PlanOutcome {
        let started = Instant::now();
        let prompt = self.compose_phase_prompt(ctx);
        self.run(ctx, prompt, DecisionType::Planning, started).await
    }

    /// Replan after new findings, producing follow-up steps rooted under
    /// the node that surfaced them.
    ///
    /// Each returned step depends on `origin_node` and carries a
    /// `finding_exists` condition referencing it. The tree bounds how many
    /// are actually appended.
    pub async fn adapt(
        &self,
        ctx: &StrategyContext,
        new_findings: &[Finding],
        origin_node: &str,
    ) -> Vec<AttackStep> {
        let started = Instant::now();
        let prompt = self.compose_adapt_prompt(ctx, new_findings, origin_node);
        let outcome = self
            .run(ctx, prompt, DecisionType::Adaptation, started)
            .await;

        // Fallback strategies are phase seeds, not follow-ups; adaptation
        // only grows the tree from genuine model output.
        if outcome.fell_back {
            return Vec::new();
        }

        outcome
            .strategy
            .recommendations
            .into_iter()
            .map(|mut step| {
                if !step.depends_on.iter().any(|d| d == origin_node) {
                    step.depends_on.push(origin_node.to_owned());
                }
                step.conditions.push(Condition {
                    kind: ConditionKind::FindingExists,
                    field: None,
                    value: Some(Value::String(origin_node.to_owned())),
                    operator: None,
                });
                step
            })
            .collect()
    }

    /// Pre-execution decision hook for a node.
    ///
    /// Deterministic: the model proposes, this rules. A node is skipped
    /// when its tool is excluded by constraints or its target has left the
    /// declared scope (targets substituted at runtime can drift). A node
    /// whose substituted target became an array while its tool only takes
    /// a single target is split: the hook returns one child per extra
    /// host, the node keeps the first, and the executor re-evaluates it.
    pub fn decide_node(&self, constraints: &Constraints, node: &TestNode) -> NodeDecision {
        if constraints.exclude_tests.iter().any(|t| t == &node.tool) {
            return NodeDecision::Skip(format!("tool '{}' excluded by constraints", node.tool));
        }
        if let Some(target) = node.parameters.get("target").and_then(Value::as_str) {
            if !constraints.in_scope(target) {
                return NodeDecision::Skip(format!("target '{target}' is out of scope"));
            }
        }

        if let Some(Value::Array(items)) = node.parameters.get("target") {
            if !ToolCatalog::is_multi_target(&node.tool) {
                let hosts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if hosts.len() > 1 {
                    let children = hosts
                        .iter()
                        .skip(1)
                        .map(|host| split_step(node, host))
                        .collect();
                    return NodeDecision::AddChildren(children);
                }
            }
        }

        NodeDecision::Execute
    }

    /// The deterministic per-phase fallback strategy.
    pub fn fallback_strategy(phase: Phase, target: &str) -> Strategy {
        let (recommendations, confidence) = match phase {
            Phase::Recon => (
                vec![
                    seed_step("fallback-subdomains", "subdomain-scanner", target),
                    seed_step("fallback-ports", "port-scanner", target),
                ],
                FALLBACK_CONFIDENCE,
            ),
            Phase::Analyze => (
                vec![seed_step("fallback-headers", "header-analyzer", target)],
                FALLBACK_CONFIDENCE,
            ),
            Phase::Exploit => (Vec::new(), FALLBACK_CONFIDENCE_EXPLOIT),
        };

        Strategy {
            phase,
            reasoning: "deterministic fallback strategy".to_owned(),
            recommendations,
            confidence_level: confidence,
            expected_outcomes: vec![],
            next_phase_conditions: vec![],
            estimated_duration_mins: DEFAULT_DURATION_MINS,
            safety_considerations: vec![DEFAULT_SAFETY_CONSIDERATION.to_owned()],
        }
    }

    /// Call the provider, parse, validate, and log one planning round.
    async fn run(
        &self,
        ctx: &StrategyContext,
        prompt: String,
        decision_type: DecisionType,
        started: Instant,
    ) -> PlanOutcome {
        let response = match self.call_provider(prompt).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(phase = %ctx.phase.as_str(), error = %e, "planner falling back");
                return self.fall_back(ctx, decision_type, e.to_string(), started);
            }
        };

        let strategy = match parse_strategy(&response.text, ctx.phase) {
            Ok(strategy) => strategy,
            Err(e) => {
                tracing::warn!(phase = %ctx.phase.as_str(), error = %e, "unparseable strategy, falling back");
                return self.fall_back(ctx, decision_type, e.to_string(), started);
            }
        };

        match self.pipeline.validate(
            &self.catalog,
            &ctx.constraints,
            &ctx.current_findings,
            &ctx.target,
            strategy,
        ) {
            Validated::Adopted {
                strategy,
                approval_candidates,
            } => {
                self.log.record(DecisionEntry::new(
                    ctx.workflow_id,
                    decision_type,
                    context_digest(ctx),
                    DecisionOutput {
                        decision: "adopted".to_owned(),
                        reasoning: strategy.reasoning.clone(),
                        confidence: strategy.confidence_level,
                    },
                    DecisionMetadata {
                        model: Some(response.model),
                        latency_ms: Some(elapsed_ms(started)),
                        tool: None,
                        level: Default::default(),
                    },
                ));
                PlanOutcome {
                    strategy,
                    fell_back: false,
                    approval_candidates,
                }
            }
            Validated::Rejected { reason } => self.fall_back(ctx, decision_type, reason, started),
        }
    }

    /// Adopt the fallback and record why.
    fn fall_back(
        &self,
        ctx: &StrategyContext,
        decision_type: DecisionType,
        reason: String,
        started: Instant,
    ) -> PlanOutcome {
        let strategy = Self::fallback_strategy(ctx.phase, &ctx.target);
        self.log.record(DecisionEntry::new(
            ctx.workflow_id,
            decision_type,
            context_digest(ctx),
            DecisionOutput {
                decision: "fallback".to_owned(),
                reasoning: reason,
                confidence: strategy.confidence_level,
            },
            DecisionMetadata {
                model: self
                    .provider
                    .as_ref()
                    .map(|p| p.model_id().to_owned()),
                latency_ms: Some(elapsed_ms(started)),
                tool: None,
                level: crate::audit::AuditLevel::Warning,
            },
        ));
        PlanOutcome {
            strategy,
            fell_back: true,
            approval_candidates: Vec::new(),
        }
    }

    async fn call_provider(
        &self,
        prompt: String,
    ) -> Result<crate::providers::CompletionResponse, PlannerError> {
        let Some(provider) = &self.provider else {
            return Err(PlannerError::Provider(ProviderError::Unavailable(
                "no provider configured".to_owned(),
            )));
        };
        let request = CompletionRequest {
            system: PLANNER_SYSTEM_PROMPT.to_owned(),
            prompt,
            max_tokens: self.max_tokens,
            temperature: Some(0.2),
        };
        match tokio::time::timeout(self.call_timeout, provider.complete(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(PlannerError::Provider(e)),
            Err(_) => Err(PlannerError::Timeout(self.call_timeout)),
        }
    }

    /// Phase prompt: target, intent, tools, findings, completed tests.
    fn compose_phase_prompt(&self, ctx: &StrategyContext) -> String {
        let findings_section = findings_digest(&ctx.current_findings);
        let completed_section = completed_digest(&ctx.completed_tests);
        let tools_section = self.catalog.names().join(", ");
        let constraints_json = serde_json::to_string(&ctx.constraints).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize constraints for prompt");
            "{}".to_owned()
        });

        format!(
            "## Phase\n{phase}\n\n\
             ## Target\n{target}\n\n\
             ## User Intent\n{intent}\n\n\
             ## Available Tools\n{tools_section}\n\n\
             ## Constraints\n{constraints_json}\n\n\
             ## Current Findings\n{findings_section}\n\n\
             ## Completed Tests\n{completed_section}\n\n\
             Propose the strategy for the {phase} phase.",
            phase = ctx.phase.as_str(),
            target = ctx.target,
            intent = ctx.user_intent,
        )
    }

    /// Adaptation prompt: the new findings and their origin.
    fn compose_adapt_prompt(
        &self,
        ctx: &StrategyContext,
        new_findings: &[Finding],
        origin_node: &str,
    ) -> String {
        let new_section = findings_digest(new_findings);
        format!(
            "{base}\n\n\
             ## New Findings (from test '{origin_node}')\n{new_section}\n\n\
             Adapt the running strategy: propose only follow-up steps that \
             investigate these new findings.",
            base = self.compose_phase_prompt(ctx),
        )
    }
}

/// Parse a strategy from model output, defaulting missing fields.
///
/// Accepts a bare JSON object or one wrapped in a markdown fence. Missing
/// fields default to: phase = `default_phase`, reasoning = "no reasoning
/// provided", recommendations = [], confidence 0.7, duration 30 minutes,
/// safety considerations = ["rate limit all requests"].
///
/// # Errors
///
/// Returns [`PlannerError::InvalidFormat`] when no JSON object is found.
pub fn parse_strategy(response: &str, default_phase: Phase) -> Result<Strategy, PlannerError> {
    let trimmed = response.trim();

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => {
            let block = extract_json_block(trimmed).ok_or_else(|| {
                PlannerError::InvalidFormat(format!(
                    "no JSON object in response: {}",
                    truncate_for_error(trimmed, 200)
                ))
            })?;
            serde_json::from_str(block)
                .map_err(|e| PlannerError::InvalidFormat(e.to_string()))?
        }
    };

    let Value::Object(map) = value else {
        return Err(PlannerError::InvalidFormat(
            "response JSON is not an object".to_owned(),
        ));
    };

    let phase = map
        .get("phase")
        .and_then(|v| serde_json::from_value::<Phase>(v.clone()).ok())
        .unwrap_or(default_phase);

    let reasoning = map
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("no reasoning provided")
        .to_owned();

    let recommendations = map
        .get("recommendations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    match serde_json::from_value::<AttackStep>(item.clone()) {
                        Ok(step) => Some(step),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed recommendation");
                            None
                        }
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let confidence_level = map
        .get("confidenceLevel")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);

    let expected_outcomes = map
        .get("expectedOutcomes")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let next_phase_conditions = map
        .get("nextPhaseConditions")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let estimated_duration_mins = map
        .get("estimatedDurationMins")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_DURATION_MINS);

    let safety_considerations = map
        .get("safetyConsiderations")
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_SAFETY_CONSIDERATION.to_owned()]);

    Ok(Strategy {
        phase,
        reasoning,
        recommendations,
        confidence_level,
        expected_outcomes,
        next_phase_conditions,
        estimated_duration_mins,
        safety_considerations,
    })
}

/// Extract JSON content from a markdown code fence.
///
/// Supports both ```json and plain ``` blocks.
fn extract_json_block(text: &str) -> Option<&str> {
    let start_marker_json = "```json";
    let start_marker_plain = "```";
    let end_marker = "```";

    let content_start = if let Some(pos) = text.find(start_marker_json) {
        pos.checked_add(start_marker_json.len())?
    } else if let Some(pos) = text.find(start_marker_plain) {
        pos.checked_add(start_marker_plain.len())?
    } else {
        return None;
    };

    let rest = text.get(content_start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let end_pos = rest.find(end_marker)?;
    let content = rest.get(..end_pos)?;
    Some(content.trim())
}

/// Build one child step of an array-target split.
fn split_step(node: &TestNode, host: &str) -> AttackStep {
    let mut parameters = node.parameters.clone();
    parameters.insert("target".to_owned(), Value::String(host.to_owned()));
    AttackStep {
        id: format!("{}-{}", node.id, pipeline::sanitize_id(host)),
        tool: node.tool.clone(),
        purpose: format!("{} against {host}", node.tool),
        parameters,
        priority: node.priority,
        owasp_category: node.owasp_category.clone(),
        safety_checks: node.safety_checks.clone(),
        requires_auth: false,
        conditions: vec![],
        depends_on: vec![],
        expected_outcome: None,
    }
}

/// Build a fallback seed step targeting the root.
fn seed_step(id: &str, tool: &str, target: &str) -> AttackStep {
    let mut parameters = serde_json::Map::new();
    parameters.insert("target".to_owned(), Value::String(target.to_owned()));
    AttackStep {
        id: id.to_owned(),
        tool: tool.to_owned(),
        purpose: format!("{tool} baseline against {target}"),
        parameters,
        priority: NodePriority::High,
        owasp_category: None,
        safety_checks: vec!["rate-limit".to_owned()],
        requires_auth: false,
        conditions: vec![],
        depends_on: vec![],
        expected_outcome: None,
    }
}

/// Compact digest of the context for decision log entries.
fn context_digest(ctx: &StrategyContext) -> Value {
    serde_json::json!({
        "phase": ctx.phase.as_str(),
        "target": ctx.target,
        "findings": ctx.current_findings.len(),
        "completedTests": ctx.completed_tests.len(),
    })
}

/// Render findings for a prompt, bounded to keep the context small.
fn findings_digest(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "none yet".to_owned();
    }
    const MAX_LINES: usize = 50;
    let mut lines: Vec<String> = findings
        .iter()
        .take(MAX_LINES)
        .map(|f| {
            format!(
                "- [{}] {} at {} (via {})",
                f.severity.as_str(),
                f.kind,
                f.target,
                f.tool
            )
        })
        .collect();
    if findings.len() > MAX_LINES {
        lines.push(format!(
            "... and {} more",
            findings.len().saturating_sub(MAX_LINES)
        ));
    }
    lines.join("\n")
}

/// Render completed tests for a prompt.
fn completed_digest(results: &[NodeResult]) -> String {
    if results.is_empty() {
        return "none yet".to_owned();
    }
    results
        .iter()
        .map(|r| {
            format!(
                "- {} ({}): {:?}, {} findings",
                r.node_id,
                r.tool,
                r.status,
                r.findings.len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Truncate a string for inclusion in error messages.
fn truncate_for_error(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    s.get(..end).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, TokenUsage};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Provider returning canned responses in order.
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ProviderError>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<String, ProviderError>>) -> Arc<dyn LlmProvider> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            let next = self
                .responses
                .lock()
                .expect("test lock")
                .pop()
                .unwrap_or(Err(ProviderError::Unavailable("script exhausted".to_owned())));
            next.map(|text| CompletionResponse {
                text,
                usage: Some(TokenUsage::default()),
                model: "scripted".to_owned(),
            })
        }

        fn model_id(&self) -> &str {
            "scripted"
        }
    }

    fn planner(provider: Option<Arc<dyn LlmProvider>>) -> Planner {
        Planner::new(
            provider,
            Arc::new(ToolCatalog::builtin()),
            "/wordlists",
            Arc::new(DecisionLog::from_writer(Box::new(std::io::sink()))),
            Duration::from_secs(5),
            2048,
        )
    }

    fn ctx(phase: Phase) -> StrategyContext {
        StrategyContext {
            workflow_id: Uuid::new_v4(),
            target: "https://example.test".to_owned(),
            user_intent: "test subdomains".to_owned(),
            current_findings: vec![],
            completed_tests: vec![],
            phase,
            constraints: Constraints::default(),
        }
    }

    // ── Parsing ──

    #[test]
    fn test_parse_strategy_bare_json() {
        let response = r#"{"phase":"recon","reasoning":"wide sweep","recommendations":[],"confidenceLevel":0.9}"#;
        let strategy = parse_strategy(response, Phase::Recon).expect("should parse");
        assert_eq!(strategy.reasoning, "wide sweep");
        assert!((strategy.confidence_level - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_strategy_fenced_json() {
        let response = "Here is my plan:\n```json\n{\"phase\":\"analyze\",\"recommendations\":[]}\n```\nDone.";
        let strategy = parse_strategy(response, Phase::Recon).expect("should parse fenced");
        assert_eq!(strategy.phase, Phase::Analyze);
    }

    #[test]
    fn test_parse_strategy_defaults_missing_fields() {
        let strategy = parse_strategy("{}", Phase::Analyze).expect("empty object parses");
        assert_eq!(strategy.phase, Phase::Analyze);
        assert_eq!(strategy.reasoning, "no reasoning provided");
        assert!(strategy.recommendations.is_empty());
        assert!((strategy.confidence_level - 0.7).abs() < f64::EPSILON);
        assert_eq!(strategy.estimated_duration_mins, 30);
        assert_eq!(
            strategy.safety_considerations,
            vec!["rate limit all requests".to_owned()]
        );
    }

    #[test]
    fn test_parse_strategy_clamps_confidence() {
        let strategy =
            parse_strategy(r#"{"confidenceLevel": 3.5}"#, Phase::Recon).expect("parses");
        assert!((strategy.confidence_level - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_strategy_skips_malformed_recommendations() {
        let response = r#"{
            "recommendations": [
                {"id": "ok", "tool": "port-scanner", "parameters": {"target": "a.test"}},
                {"tool": 42}
            ]
        }"#;
        let strategy = parse_strategy(response, Phase::Recon).expect("parses");
        assert_eq!(strategy.recommendations.len(), 1);
        assert_eq!(strategy.recommendations[0].id, "ok");
    }

    #[test]
    fn test_parse_strategy_rejects_prose() {
        let result = parse_strategy("I cannot help with that.", Phase::Recon);
        assert!(matches!(result, Err(PlannerError::InvalidFormat(_))));
    }

    // ── Fallback ──

    #[test]
    fn test_fallback_by_phase() {
        let recon = Planner::fallback_strategy(Phase::Recon, "https://example.test");
        assert_eq!(recon.recommendations.len(), 2);
        assert_eq!(recon.recommendations[0].tool, "subdomain-scanner");
        assert_eq!(recon.recommendations[1].tool, "port-scanner");
        assert!((recon.confidence_level - 0.5).abs() < f64::EPSILON);

        let analyze = Planner::fallback_strategy(Phase::Analyze, "https://example.test");
        assert_eq!(analyze.recommendations.len(), 1);
        assert_eq!(analyze.recommendations[0].tool, "header-analyzer");

        let exploit = Planner::fallback_strategy(Phase::Exploit, "https://example.test");
        assert!(exploit.recommendations.is_empty());
        assert!((exploit.confidence_level - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_plan_without_provider_falls_back() {
        let planner = planner(None);
        let outcome = planner.plan(&ctx(Phase::Recon)).await;
        assert!(outcome.fell_back);
        assert_eq!(outcome.strategy.recommendations.len(), 2);
    }

    #[tokio::test]
    async fn test_plan_provider_error_falls_back() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Unavailable(
            "down".to_owned(),
        ))]);
        let planner = planner(Some(provider));
        let outcome = planner.plan(&ctx(Phase::Analyze)).await;
        assert!(outcome.fell_back);
        assert_eq!(outcome.strategy.recommendations[0].tool, "header-analyzer");
    }

    #[tokio::test]
    async fn test_plan_unsafe_strategy_falls_back() {
        // Unknown tool in the response rejects the whole strategy.
        let provider = ScriptedProvider::new(vec![Ok(r#"{
            "phase": "recon",
            "recommendations": [
                {"id": "evil", "tool": "backdoor-installer", "parameters": {"target": "x"}}
            ]
        }"#
        .to_owned())]);
        let planner = planner(Some(provider));
        let outcome = planner.plan(&ctx(Phase::Recon)).await;
        assert!(outcome.fell_back, "unsafe strategy must be replaced");
        assert_eq!(outcome.strategy.recommendations[0].tool, "subdomain-scanner");
        assert!((outcome.strategy.confidence_level - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_plan_adopts_valid_strategy() {
        let provider = ScriptedProvider::new(vec![Ok(r#"{
            "phase": "recon",
            "reasoning": "enumerate first",
            "recommendations": [
                {"id": "r1", "tool": "subdomain-scanner", "parameters": {"target": "example.test"}}
            ],
            "confidenceLevel": 0.85
        }"#
        .to_owned())]);
        let planner = planner(Some(provider));
        let outcome = planner.plan(&ctx(Phase::Recon)).await;
        assert!(!outcome.fell_back);
        assert_eq!(outcome.strategy.reasoning, "enumerate first");
        assert!(outcome
            .strategy
            .recommendations
            .iter()
            .any(|s| s.id == "r1"));
    }

    // ── Adaptation ──

    #[tokio::test]
    async fn test_adapt_roots_steps_under_origin() {
        let provider = ScriptedProvider::new(vec![Ok(r#"{
            "phase": "recon",
            "recommendations": [
                {"id": "followup-1", "tool": "port-scanner", "parameters": {"target": "a.example.test"}}
            ]
        }"#
        .to_owned())]);
        let planner = planner(Some(provider));
        let steps = planner
            .adapt(&ctx(Phase::Recon), &[], "origin-node")
            .await;

        assert!(!steps.is_empty());
        for step in &steps {
            assert!(
                step.depends_on.iter().any(|d| d == "origin-node"),
                "follow-up must depend on the origin node"
            );
            assert!(
                step.conditions.iter().any(|c| {
                    c.kind == ConditionKind::FindingExists
                        && c.value == Some(Value::String("origin-node".to_owned()))
                }),
                "follow-up must carry a finding_exists condition on the origin"
            );
        }
    }

    #[tokio::test]
    async fn test_adapt_returns_nothing_on_fallback() {
        let planner = planner(None);
        let steps = planner.adapt(&ctx(Phase::Recon), &[], "origin").await;
        assert!(steps.is_empty(), "fallback seeds must not become follow-ups");
    }

    // ── Decision hook ──

    #[test]
    fn test_decide_node_excluded_tool() {
        let planner = planner(None);
        let constraints = Constraints {
            exclude_tests: vec!["port-scanner".to_owned()],
            ..Constraints::default()
        };
        let node = TestNode::from_step(seed_step("n1", "port-scanner", "example.test"));
        assert!(matches!(
            planner.decide_node(&constraints, &node),
            NodeDecision::Skip(reason) if reason.contains("excluded")
        ));
    }

    #[test]
    fn test_decide_node_out_of_scope() {
        let planner = planner(None);
        let constraints = Constraints {
            scope: vec!["example.test".to_owned()],
            ..Constraints::default()
        };
        let node = TestNode::from_step(seed_step("n1", "port-scanner", "other.invalid"));
        assert!(matches!(
            planner.decide_node(&constraints, &node),
            NodeDecision::Skip(reason) if reason.contains("scope")
        ));
    }

    #[test]
    fn test_decide_node_executes_by_default() {
        let planner = planner(None);
        let node = TestNode::from_step(seed_step("n1", "port-scanner", "example.test"));
        assert_eq!(
            planner.decide_node(&Constraints::default(), &node),
            NodeDecision::Execute
        );
    }

    #[test]
    fn test_decide_node_splits_array_target_for_single_target_tool() {
        let planner = planner(None);
        let mut node = TestNode::from_step(seed_step("ssl-1", "ssl-checker", "placeholder"));
        node.parameters.insert(
            "target".to_owned(),
            serde_json::json!(["a.example.test", "b.example.test", "c.example.test"]),
        );

        match planner.decide_node(&Constraints::default(), &node) {
            NodeDecision::AddChildren(children) => {
                assert_eq!(children.len(), 2, "one child per extra host");
                let targets: Vec<&str> = children
                    .iter()
                    .filter_map(|s| s.parameters.get("target").and_then(Value::as_str))
                    .collect();
                assert_eq!(targets, vec!["b.example.test", "c.example.test"]);
                assert!(children.iter().all(|s| s.tool == "ssl-checker"));
                let mut ids: Vec<&str> = children.iter().map(|s| s.id.as_str()).collect();
                ids.sort_unstable();
                ids.dedup();
                assert_eq!(ids.len(), 2, "child ids are unique");
            }
            other => panic!("expected AddChildren, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_node_array_target_executes_for_multi_target_tool() {
        // port-scanner fans out inside the engine; no split needed.
        let planner = planner(None);
        let mut node = TestNode::from_step(seed_step("scan-1", "port-scanner", "placeholder"));
        node.parameters.insert(
            "target".to_owned(),
            serde_json::json!(["a.example.test", "b.example.test"]),
        );
        assert_eq!(
            planner.decide_node(&Constraints::default(), &node),
            NodeDecision::Execute
        );
    }

    // ── Fence extraction ──

    #[test]
    fn test_extract_json_block_variants() {
        assert_eq!(
            extract_json_block("```json\n{\"a\":1}\n```"),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(extract_json_block("```\n{\"a\":1}\n```"), Some(r#"{"a":1}"#));
        assert_eq!(extract_json_block("no fence"), None);
    }
}
