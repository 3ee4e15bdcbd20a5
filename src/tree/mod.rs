//! Dynamic test tree: a dependency- and condition-driven DAG executor.
//!
//! The tree is built from a validated strategy: the first recommendation
//! becomes the root, later ones become children (when their dependencies
//! reference known nodes) or parallel branches of the root, and keeps
//! growing at runtime as findings trigger planner adaptations. Nodes are
//! addressed by stable ids only; eligibility (dependencies completed,
//! conditions true) is re-checked on every dispatch attempt and never
//! cached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventKind};
use crate::executor::{ExecutionEngine, ExecutionRequest, ExecutionStatus};
use crate::planner::{NodeDecision, Planner, StrategyContext};
use crate::types::{
    AttackStep, Condition, ConditionKind, ConditionOperator, Finding, NodePriority, NodeResult,
    NodeStatus, Strategy, TestNode,
};

/// Follow-up children appended per finding batch.
const ADAPTATION_LIMIT: usize = 3;

/// The node DAG of one phase.
#[derive(Debug, Default)]
pub struct TestTree {
    nodes: HashMap<String, TestNode>,
    root: Option<String>,
}

impl TestTree {
    /// Build a tree from a validated strategy.
    ///
    /// The first recommendation is the root. A later step whose
    /// `dependsOn` references a known node becomes that node's child;
    /// anything else becomes a parallel branch under the root.
    pub fn from_strategy(strategy: &Strategy) -> Self {
        let mut tree = Self::default();
        for step in &strategy.recommendations {
            tree.insert_step(step.clone());
        }
        tree
    }

    /// Insert one step, wiring parent/child links.
    pub fn insert_step(&mut self, step: AttackStep) {
        let mut node = TestNode::from_step(step);
        if let Some(id) = node
            .dependencies
            .iter()
            .find(|dep| self.nodes.contains_key(*dep))
            .cloned()
        {
            node.parent = Some(id.clone());
            if let Some(parent) = self.nodes.get_mut(&id) {
                parent.children.push(node.id.clone());
            }
        } else if let Some(root_id) = &self.root {
            node.parent = Some(root_id.clone());
            // Unresolvable declared dependencies would deadlock the
            // scheduler; a branch of the root keeps the step runnable.
            node.dependencies.retain(|dep| self.nodes.contains_key(dep));
            if let Some(root) = self.nodes.get_mut(root_id) {
                root.children.push(node.id.clone());
            }
        } else {
            node.dependencies.clear();
            self.root = Some(node.id.clone());
        }

        self.nodes.insert(node.id.clone(), node);
    }

    /// Number of nodes currently in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root node id, when the tree is non-empty.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Immutable node access.
    pub fn get(&self, id: &str) -> Option<&TestNode> {
        self.nodes.get(id)
    }
}

/// Everything the executor returns about one tree run.
#[derive(Debug)]
pub struct ExecutionRecord {
    /// Final node map.
    pub nodes: HashMap<String, TestNode>,
    /// Results in completion order.
    pub history: Vec<NodeResult>,
    /// Ids of nodes that ended skipped.
    pub skipped: Vec<String>,
    /// Ids of nodes that ended failed.
    pub failed: Vec<String>,
    /// Findings produced during the run, in arrival order.
    pub findings: Vec<Finding>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Dependency/condition-driven executor over an [`ExecutionEngine`].
pub struct TreeExecutor {
    engine: Arc<ExecutionEngine>,
    planner: Arc<Planner>,
    bus: EventBus,
    poll_interval: Duration,
}

impl TreeExecutor {
    /// Create an executor.
    pub fn new(
        engine: Arc<ExecutionEngine>,
        planner: Arc<Planner>,
        bus: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            planner,
            bus,
            poll_interval,
        }
    }

    /// Run the tree to completion (or cancellation).
    ///
    /// `ctx` supplies the planning context for adaptations; its findings
    /// are treated as the baseline and grow as nodes complete.
    pub async fn run(
        &self,
        mut tree: TestTree,
        ctx: &StrategyContext,
        cancel: &CancellationToken,
    ) -> ExecutionRecord {
        let started = tokio::time::Instant::now();
        let workflow_id = ctx.workflow_id;

        self.bus
            .publish(workflow_id, EventKind::TreeBuilt { nodes: tree.len() });

        let mut queue: VecDeque<String> = tree.nodes.keys().cloned().collect();
        let mut in_flight: JoinSet<(String, crate::executor::ExecutionResult)> = JoinSet::new();
        let mut results: HashMap<String, NodeResult> = HashMap::new();
        let mut history: Vec<NodeResult> = Vec::new();
        let mut findings: Vec<Finding> = Vec::new();
        let mut adapt_ctx = ctx.clone();
        // Ids that already triggered an adaptation; one batch per node.
        let mut adapted: HashSet<String> = HashSet::new();
        // Nodes examined since the last dispatch or completion; when the
        // whole queue cycles without progress and nothing is running, the
        // remainder is unreachable.
        let mut stalled_scan = 0usize;

        while !queue.is_empty() || !in_flight.is_empty() {
            if cancel.is_cancelled() {
                self.drain_cancelled(&mut tree, &mut queue, &mut in_flight, &mut results)
                    .await;
                break;
            }

            // Dispatch phase: examine the queue head.
            if let Some(id) = queue.pop_front() {
                let Some(node) = tree.nodes.get(&id) else {
                    continue;
                };
                if node.status != NodeStatus::Pending {
                    continue;
                }

                match self.eligibility(node, &tree, &results) {
                    Eligibility::Ready => {
                        stalled_scan = 0;
                        self.dispatch(
                            &mut tree,
                            &id,
                            &adapt_ctx,
                            &results,
                            &history,
                            &mut queue,
                            cancel,
                            &mut in_flight,
                        );
                        continue;
                    }
                    Eligibility::Blocked => {
                        queue.push_back(id);
                        stalled_scan = stalled_scan.saturating_add(1);
                    }
                    Eligibility::Dead(reason) => {
                        stalled_scan = 0;
                        self.mark_skipped(&mut tree, &id, &reason, &mut results);
                    }
                }
            }

            let queue_cycled = stalled_scan >= queue.len().max(1) && !queue.is_empty();

            if in_flight.is_empty() {
                if queue_cycled {
                    // Nothing running and nothing dispatchable: the rest
                    // can never become eligible.
                    while let Some(id) = queue.pop_front() {
                        self.mark_skipped(
                            &mut tree,
                            &id,
                            "dependencies or conditions can no longer be satisfied",
                            &mut results,
                        );
                    }
                }
                continue;
            }

            // Collect phase: wait for a completion when the queue is
            // blocked, otherwise just poll so dispatching keeps flowing.
            let joined = if queue_cycled || queue.is_empty() {
                tokio::select! {
                    joined = in_flight.join_next() => joined,
                    () = cancel.cancelled() => None,
                    () = tokio::time::sleep(self.poll_interval) => None,
                }
            } else {
                match tokio::time::timeout(Duration::ZERO, in_flight.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => continue,
                }
            };

            let Some(joined) = joined else { continue };
            let Ok((node_id, result)) = joined else {
                warn!("tree task panicked; continuing");
                continue;
            };
            stalled_scan = 0;

            self.absorb_result(
                &mut tree,
                &node_id,
                result,
                &mut queue,
                &mut results,
                &mut history,
                &mut findings,
                &mut adapt_ctx,
                &mut adapted,
            )
            .await;
        }

        // Anything still pending after cancellation is skipped.
        let pending: Vec<String> = tree
            .nodes
            .values()
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Running))
            .map(|n| n.id.clone())
            .collect();
        for id in pending {
            self.mark_skipped(&mut tree, &id, "workflow cancelled", &mut results);
        }

        let skipped = ids_with_status(&tree, NodeStatus::Skipped);
        let failed = ids_with_status(&tree, NodeStatus::Failed);

        ExecutionRecord {
            nodes: tree.nodes,
            history,
            skipped,
            failed,
            findings,
            duration: started.elapsed(),
        }
    }

    /// Dispatch one ready node into the join set.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        tree: &mut TestTree,
        id: &str,
        ctx: &StrategyContext,
        results: &HashMap<String, NodeResult>,
        history: &[NodeResult],
        queue: &mut VecDeque<String>,
        cancel: &CancellationToken,
        in_flight: &mut JoinSet<(String, crate::executor::ExecutionResult)>,
    ) {
        // Decision hook before execution.
        let decision = {
            let Some(node) = tree.nodes.get_mut(id) else {
                return;
            };
            // Late binding: `{{tool.results}}` references resolve against
            // the results accumulated so far, just before dispatch.
            substitute_parameters(&mut node.parameters, results, history);
            self.planner.decide_node(&ctx.constraints, node)
        };

        match decision {
            NodeDecision::Execute => {
                self.bus.publish(
                    ctx.workflow_id,
                    EventKind::NodeDecision {
                        node_id: id.to_owned(),
                        decision: "execute".to_owned(),
                    },
                );
            }
            NodeDecision::Skip(reason) => {
                self.bus.publish(
                    ctx.workflow_id,
                    EventKind::NodeDecision {
                        node_id: id.to_owned(),
                        decision: "skip".to_owned(),
                    },
                );
                if let Some(node) = tree.nodes.get_mut(id) {
                    node.status = NodeStatus::Skipped;
                    node.ended_at = Some(Utc::now());
                    node.result = Some(skip_result(node, &reason));
                }
                return;
            }
            NodeDecision::AddChildren(steps) => {
                self.bus.publish(
                    ctx.workflow_id,
                    EventKind::NodeDecision {
                        node_id: id.to_owned(),
                        decision: "add-children".to_owned(),
                    },
                );
                self.add_children(tree, id, steps, queue);
                // The children own the extra targets; the node keeps the
                // first so the next evaluation rules Execute.
                if let Some(node) = tree.nodes.get_mut(id) {
                    if let Some(Value::Array(items)) = node.parameters.get("target").cloned() {
                        if let Some(first) = items.iter().find_map(Value::as_str) {
                            node.parameters
                                .insert("target".to_owned(), Value::String(first.to_owned()));
                        }
                    }
                }
                // The node itself goes back for re-evaluation.
                queue.push_back(id.to_owned());
                return;
            }
        }

        let Some(node) = tree.nodes.get_mut(id) else {
            return;
        };
        node.status = NodeStatus::Running;
        node.started_at = Some(Utc::now());
        self.bus.publish(
            ctx.workflow_id,
            EventKind::NodeStart {
                node_id: id.to_owned(),
                tool: node.tool.clone(),
            },
        );

        let request = ExecutionRequest {
            tool: node.tool.clone(),
            parameters: node.parameters.clone(),
            workflow_id: ctx.workflow_id,
            phase: ctx.phase,
            priority: node.priority,
            timeout: None,
            safety_checks: node.safety_checks.clone(),
        };
        let engine = Arc::clone(&self.engine);
        let constraints = ctx.constraints.clone();
        let cancel = cancel.clone();
        let node_id = id.to_owned();
        in_flight.spawn(async move {
            let result = engine.execute(request, &constraints, &cancel).await;
            (node_id, result)
        });
    }

    /// Insert decision-hook children under `origin` and queue them.
    fn add_children(
        &self,
        tree: &mut TestTree,
        origin: &str,
        steps: Vec<AttackStep>,
        queue: &mut VecDeque<String>,
    ) {
        let mut added = 0usize;
        for mut step in steps {
            if tree.nodes.contains_key(&step.id) {
                step.id = format!("{}-child-{}", step.id, tree.len());
            }
            let id = step.id.clone();
            tree.insert_step(step);
            if let Some(node) = tree.nodes.get_mut(&id) {
                node.parent = Some(origin.to_owned());
            }
            if let Some(origin_node) = tree.nodes.get_mut(origin) {
                if !origin_node.children.iter().any(|c| c == &id) {
                    origin_node.children.push(id.clone());
                }
            }
            queue.push_back(id);
            added = added.saturating_add(1);
        }
        if added > 0 {
            info!(origin, added, "decision hook added child nodes");
        }
    }

    /// Fold one engine result back into the tree.
    #[allow(clippy::too_many_arguments)]
    async fn absorb_result(
        &self,
        tree: &mut TestTree,
        node_id: &str,
        result: crate::executor::ExecutionResult,
        queue: &mut VecDeque<String>,
        results: &mut HashMap<String, NodeResult>,
        history: &mut Vec<NodeResult>,
        findings: &mut Vec<Finding>,
        adapt_ctx: &mut StrategyContext,
        adapted: &mut HashSet<String>,
    ) {
        let workflow_id = adapt_ctx.workflow_id;
        let Some(node) = tree.nodes.get_mut(node_id) else {
            return;
        };

        match result.status {
            ExecutionStatus::Completed => {
                let node_result = NodeResult {
                    node_id: node_id.to_owned(),
                    tool: node.tool.clone(),
                    status: NodeStatus::Completed,
                    findings: result.findings.clone(),
                    output: result.output,
                    error: None,
                    duration_ms: millis(result.duration),
                };
                node.status = NodeStatus::Completed;
                node.ended_at = Some(Utc::now());
                node.result = Some(node_result.clone());

                self.bus.publish(
                    workflow_id,
                    EventKind::NodeComplete {
                        node_id: node_id.to_owned(),
                        findings: result.findings.len(),
                    },
                );

                findings.extend(result.findings.iter().cloned());
                adapt_ctx.current_findings.extend(result.findings.iter().cloned());
                adapt_ctx.completed_tests.push(node_result.clone());
                results.insert(node_id.to_owned(), node_result.clone());
                history.push(node_result);

                // New findings trigger one bounded adaptation per node.
                if !result.findings.is_empty() && adapted.insert(node_id.to_owned()) {
                    self.adapt(tree, node_id, &result.findings, queue, adapt_ctx)
                        .await;
                }
            }
            ExecutionStatus::Failed => {
                if node.retry_count < node.max_retries {
                    node.retry_count = node.retry_count.saturating_add(1);
                    node.status = NodeStatus::Pending;
                    info!(
                        node = node_id,
                        attempt = node.retry_count,
                        max = node.max_retries,
                        "retrying failed node"
                    );
                    // Retries jump the queue.
                    queue.push_front(node_id.to_owned());
                } else {
                    let error = result.error.unwrap_or_else(|| "execution failed".to_owned());
                    let node_result = NodeResult {
                        node_id: node_id.to_owned(),
                        tool: node.tool.clone(),
                        status: NodeStatus::Failed,
                        findings: vec![],
                        output: String::new(),
                        error: Some(error.clone()),
                        duration_ms: millis(result.duration),
                    };
                    node.status = NodeStatus::Failed;
                    node.ended_at = Some(Utc::now());
                    node.result = Some(node_result.clone());
                    results.insert(node_id.to_owned(), node_result.clone());
                    history.push(node_result);
                    self.bus.publish(
                        workflow_id,
                        EventKind::NodeFailed {
                            node_id: node_id.to_owned(),
                            error,
                        },
                    );
                }
            }
            ExecutionStatus::Skipped => {
                let reason = result
                    .error
                    .unwrap_or_else(|| "skipped by restraint".to_owned());
                node.status = NodeStatus::Skipped;
                node.ended_at = Some(Utc::now());
                let node_result = NodeResult {
                    node_id: node_id.to_owned(),
                    tool: node.tool.clone(),
                    status: NodeStatus::Skipped,
                    findings: vec![],
                    output: String::new(),
                    error: Some(reason),
                    duration_ms: millis(result.duration),
                };
                node.result = Some(node_result.clone());
                results.insert(node_id.to_owned(), node_result.clone());
                history.push(node_result);
            }
        }
    }

    /// Append up to [`ADAPTATION_LIMIT`] critical/high follow-up children.
    async fn adapt(
        &self,
        tree: &mut TestTree,
        origin: &str,
        new_findings: &[Finding],
        queue: &mut VecDeque<String>,
        ctx: &StrategyContext,
    ) {
        let steps = self.planner.adapt(ctx, new_findings, origin).await;
        let mut added = 0usize;
        for mut step in steps {
            if added >= ADAPTATION_LIMIT {
                break;
            }
            if !matches!(step.priority, NodePriority::Critical | NodePriority::High) {
                continue;
            }
            if tree.nodes.contains_key(&step.id) {
                step.id = format!("{}-adapt-{}", step.id, tree.len());
            }
            let id = step.id.clone();
            // Substituted parameters resolve against the origin's results
            // at dispatch time.
            tree.insert_step(step);
            if let Some(node) = tree.nodes.get_mut(&id) {
                node.parent = Some(origin.to_owned());
            }
            if let Some(origin_node) = tree.nodes.get_mut(origin) {
                if !origin_node.children.iter().any(|c| c == &id) {
                    origin_node.children.push(id.clone());
                }
            }
            queue.push_back(id);
            added = added.saturating_add(1);
        }

        if added > 0 {
            info!(origin, added, "tree adapted with follow-up nodes");
            self.bus.publish(
                ctx.workflow_id,
                EventKind::TreeAdapted {
                    origin_node: origin.to_owned(),
                    added,
                },
            );
        }
    }

    /// Evaluate dependency and condition eligibility for a node.
    fn eligibility(
        &self,
        node: &TestNode,
        tree: &TestTree,
        results: &HashMap<String, NodeResult>,
    ) -> Eligibility {
        for dep in &node.dependencies {
            match tree.nodes.get(dep).map(|n| n.status) {
                Some(NodeStatus::Completed) => {}
                Some(NodeStatus::Failed) | Some(NodeStatus::Skipped) => {
                    return Eligibility::Dead(format!("dependency '{dep}' did not complete"));
                }
                Some(_) => return Eligibility::Blocked,
                None => return Eligibility::Dead(format!("dependency '{dep}' does not exist")),
            }
        }

        // Unmet conditions keep the node queued: results only accumulate,
        // so a condition false now may hold after the next completion. The
        // stall detector skips nodes whose conditions can never hold.
        for condition in &node.conditions {
            if !evaluate_condition(condition, results) {
                return Eligibility::Blocked;
            }
        }

        Eligibility::Ready
    }

    /// Mark a node skipped outside the dispatch path.
    fn mark_skipped(
        &self,
        tree: &mut TestTree,
        id: &str,
        reason: &str,
        results: &mut HashMap<String, NodeResult>,
    ) {
        let Some(node) = tree.nodes.get_mut(id) else {
            return;
        };
        if matches!(
            node.status,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        ) {
            return;
        }
        debug!(node = id, reason, "node skipped");
        node.status = NodeStatus::Skipped;
        node.ended_at = Some(Utc::now());
        let node_result = skip_result(node, reason);
        node.result = Some(node_result.clone());
        results.insert(id.to_owned(), node_result);
    }

    /// Cancellation: stop dispatching and let in-flight tasks unwind.
    async fn drain_cancelled(
        &self,
        tree: &mut TestTree,
        queue: &mut VecDeque<String>,
        in_flight: &mut JoinSet<(String, crate::executor::ExecutionResult)>,
        results: &mut HashMap<String, NodeResult>,
    ) {
        while let Some(id) = queue.pop_front() {
            self.mark_skipped(tree, &id, "workflow cancelled", results);
        }
        // In-flight executions observe the token, kill their containers,
        // and resolve as failed("cancelled").
        while let Some(joined) = in_flight.join_next().await {
            let Ok((node_id, result)) = joined else {
                continue;
            };
            if let Some(node) = tree.nodes.get_mut(&node_id) {
                node.status = NodeStatus::Failed;
                node.ended_at = Some(Utc::now());
                node.result = Some(NodeResult {
                    node_id: node_id.clone(),
                    tool: node.tool.clone(),
                    status: NodeStatus::Failed,
                    findings: vec![],
                    output: String::new(),
                    error: result.error.or(Some("cancelled".to_owned())),
                    duration_ms: millis(result.duration),
                });
            }
        }
    }
}

/// Eligibility verdict for a pending node.
enum Eligibility {
    /// Dispatch now.
    Ready,
    /// Dependencies still pending or running; retry later.
    Blocked,
    /// Can never run; skip with this reason.
    Dead(String),
}

/// Evaluate one condition against accumulated results.
pub fn evaluate_condition(
    condition: &Condition,
    results: &HashMap<String, NodeResult>,
) -> bool {
    match condition.kind {
        ConditionKind::FindingExists => match condition.value.as_ref().and_then(Value::as_str) {
            Some(node_id) => results
                .get(node_id)
                .is_some_and(|r| !r.findings.is_empty()),
            None => results.values().any(|r| !r.findings.is_empty()),
        },
        ConditionKind::NoFindings => {
            let Some(node_id) = condition.value.as_ref().and_then(Value::as_str) else {
                return results.values().all(|r| r.findings.is_empty());
            };
            results
                .get(node_id)
                .is_none_or(|r| r.findings.is_empty())
        }
        ConditionKind::FindingMatches => {
            let operator = condition.operator.unwrap_or(ConditionOperator::Exists);
            results
                .values()
                .flat_map(|r| r.findings.iter())
                .any(|finding| finding_matches(finding, condition, operator))
        }
        ConditionKind::Custom => true,
    }
}

/// Apply a `finding_matches` operator to one finding.
fn finding_matches(
    finding: &Finding,
    condition: &Condition,
    operator: ConditionOperator,
) -> bool {
    let field = condition.field.as_deref().unwrap_or("type");
    let actual = finding_field(finding, field);

    match operator {
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::NotExists => actual.is_none(),
        ConditionOperator::Equals => match (&actual, &condition.value) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        ConditionOperator::Contains => {
            let Some(actual) = actual else { return false };
            let Some(expected) = condition.value.as_ref() else {
                return false;
            };
            coerce_string(&actual).contains(&coerce_string(expected))
        }
        ConditionOperator::GreaterThan => {
            let Some(actual) = actual else { return false };
            let (Some(a), Some(b)) = (
                coerce_number(&actual),
                condition.value.as_ref().and_then(coerce_number_ref),
            ) else {
                return false;
            };
            a > b
        }
    }
}

/// Look up a finding field by name, falling through to the data map.
fn finding_field(finding: &Finding, field: &str) -> Option<Value> {
    match field {
        "type" => Some(Value::String(finding.kind.clone())),
        "severity" => Some(Value::String(finding.severity.as_str().to_owned())),
        "target" => Some(Value::String(finding.target.clone())),
        "tool" => Some(Value::String(finding.tool.clone())),
        "confidence" => serde_json::Number::from_f64(finding.confidence).map(Value::Number),
        other => finding.data.get(other).cloned(),
    }
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn coerce_number_ref(value: &Value) -> Option<f64> {
    coerce_number(value)
}

/// Resolve `{{tool.results}}` parameter references just before dispatch.
///
/// For `subdomain-scanner` the substitution yields the list of non-empty
/// output lines of the first completed node of that tool; for any other
/// tool it yields that node's findings.
pub fn substitute_parameters(
    parameters: &mut serde_json::Map<String, Value>,
    results: &HashMap<String, NodeResult>,
    history: &[NodeResult],
) {
    let keys: Vec<String> = parameters.keys().cloned().collect();
    for key in keys {
        let Some(Value::String(raw)) = parameters.get(&key) else {
            continue;
        };
        let Some(tool) = raw
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix(".results}}"))
        else {
            continue;
        };
        let tool = tool.to_owned();

        // First completed node of that tool, in completion order.
        let source = history
            .iter()
            .filter(|r| r.status == NodeStatus::Completed && r.tool == tool)
            .find(|r| results.contains_key(&r.node_id));
        let Some(source) = source else { continue };

        let replacement = if tool == "subdomain-scanner" {
            let lines: Vec<Value> = source
                .output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_owned()))
                .collect();
            Value::Array(lines)
        } else {
            serde_json::to_value(&source.findings).unwrap_or(Value::Array(vec![]))
        };
        parameters.insert(key, replacement);
    }
}

fn skip_result(node: &TestNode, reason: &str) -> NodeResult {
    NodeResult {
        node_id: node.id.clone(),
        tool: node.tool.clone(),
        status: NodeStatus::Skipped,
        findings: vec![],
        output: String::new(),
        error: Some(reason.to_owned()),
        duration_ms: 0,
    }
}

fn ids_with_status(tree: &TestTree, status: NodeStatus) -> Vec<String> {
    let mut ids: Vec<String> = tree
        .nodes
        .values()
        .filter(|n| n.status == status)
        .map(|n| n.id.clone())
        .collect();
    ids.sort_unstable();
    ids
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
