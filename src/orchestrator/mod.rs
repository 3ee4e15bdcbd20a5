//! Orchestrator: owns workflows from submission to terminal state.
//!
//! Drives the progressive-discovery phases, consults the planner per
//! phase, runs the test tree, aggregates findings, and enforces the
//! workflow-level deadline. All state changes are published on the event
//! bus; the final workflow record is persisted next to the decision log
//! before the run task exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::approval::ApprovalQueue;
use crate::discovery::{ProgressiveDiscovery, TransitionContext};
use crate::events::{EventBus, EventKind};
use crate::executor::ExecutionEngine;
use crate::planner::{Planner, StrategyContext};
use crate::tree::{TestTree, TreeExecutor};
use crate::types::{
    Constraints, Finding, FindingSummary, NodePriority, NodeStatus, Phase, PhaseRecord, TestNode,
    Workflow, WorkflowId, WorkflowStatus,
};

/// Ceiling on the expansion floor; anything above is a caller mistake.
const MAX_MIN_TESTS_PER_PHASE: usize = 500;

/// Submission validation errors, surfaced to the caller synchronously.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The target is neither a valid URL nor a plausible host.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// The intent text is empty.
    #[error("intent must not be empty")]
    EmptyIntent,
    /// A constraint value is out of range.
    #[error("invalid constraints: {0}")]
    InvalidConstraints(String),
}

/// Point-in-time view of a workflow for the status API.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    /// Workflow id.
    pub id: WorkflowId,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Current (or last driven) phase.
    pub phase: Phase,
    /// Fraction of phases finished, in [0, 1].
    pub progress: f64,
    /// Findings accumulated so far.
    pub partial_results: Vec<Finding>,
    /// Whether the deadline truncated the run.
    pub truncated: bool,
}

struct WorkflowHandle {
    state: Arc<RwLock<Workflow>>,
    cancel: CancellationToken,
}

/// The workflow owner and phase driver.
pub struct Orchestrator {
    planner: Arc<Planner>,
    engine: Arc<ExecutionEngine>,
    approvals: ApprovalQueue,
    discovery: ProgressiveDiscovery,
    bus: EventBus,
    poll_interval: Duration,
    record_dir: PathBuf,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowHandle>>>,
}

impl Orchestrator {
    /// Assemble the orchestrator.
    pub fn new(
        planner: Arc<Planner>,
        engine: Arc<ExecutionEngine>,
        approvals: ApprovalQueue,
        discovery: ProgressiveDiscovery,
        bus: EventBus,
        poll_interval: Duration,
        record_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            planner,
            engine,
            approvals,
            discovery,
            bus,
            poll_interval,
            record_dir: record_dir.into(),
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate and accept a submission, starting asynchronous execution.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError`] when the target, intent, or constraints are
    /// invalid. Two identical submissions yield two distinct workflows.
    pub fn submit(
        &self,
        target: &str,
        intent: &str,
        constraints: Constraints,
    ) -> Result<WorkflowId, SubmitError> {
        let target = validate_target(target)?;
        if intent.trim().is_empty() {
            return Err(SubmitError::EmptyIntent);
        }
        validate_constraints(&constraints)?;

        let workflow = Workflow::new(target.clone(), intent.trim().to_owned(), constraints);
        let id = workflow.id;
        info!(workflow = %id, %target, "workflow submitted");

        self.bus.publish(
            id,
            EventKind::WorkflowStart {
                target,
                intent: workflow.intent.clone(),
            },
        );

        let state = Arc::new(RwLock::new(workflow));
        let cancel = CancellationToken::new();
        if let Ok(mut workflows) = self.workflows.write() {
            workflows.insert(
                id,
                WorkflowHandle {
                    state: Arc::clone(&state),
                    cancel: cancel.clone(),
                },
            );
        }

        let runner = WorkflowRunner {
            planner: Arc::clone(&self.planner),
            engine: Arc::clone(&self.engine),
            approvals: self.approvals.clone(),
            discovery: self.discovery.clone(),
            bus: self.bus.clone(),
            poll_interval: self.poll_interval,
            record_dir: self.record_dir.clone(),
            state,
            cancel,
        };
        tokio::spawn(async move { runner.run().await });

        Ok(id)
    }

    /// Current snapshot of a workflow, if known.
    pub fn status(&self, id: WorkflowId) -> Option<WorkflowSnapshot> {
        let workflows = self.workflows.read().ok()?;
        let handle = workflows.get(&id)?;
        let workflow = handle.state.read().ok()?;
        Some(snapshot_of(&workflow))
    }

    /// Cooperatively cancel a workflow. Idempotent.
    ///
    /// Returns false for unknown ids.
    pub fn cancel(&self, id: WorkflowId) -> bool {
        let Ok(workflows) = self.workflows.read() else {
            return false;
        };
        let Some(handle) = workflows.get(&id) else {
            return false;
        };
        if !handle.cancel.is_cancelled() {
            info!(workflow = %id, "cancellation requested");
            handle.cancel.cancel();
            self.approvals.deny_workflow(id, "workflow cancelled");
        }
        true
    }
}

/// The spawned per-workflow run task.
struct WorkflowRunner {
    planner: Arc<Planner>,
    engine: Arc<ExecutionEngine>,
    approvals: ApprovalQueue,
    discovery: ProgressiveDiscovery,
    bus: EventBus,
    poll_interval: Duration,
    record_dir: PathBuf,
    state: Arc<RwLock<Workflow>>,
    cancel: CancellationToken,
}

impl WorkflowRunner {
    async fn run(self) {
        let (id, time_limit) = {
            let Ok(mut workflow) = self.state.write() else {
                return;
            };
            workflow.status = WorkflowStatus::Running;
            (workflow.id, workflow.constraints.time_limit)
        };
        self.bus.publish(
            id,
            EventKind::StatusChanged {
                status: WorkflowStatus::Running,
            },
        );

        // The work token is a child of the user-cancel token so a deadline
        // stops the tree without looking like a user cancellation.
        let work_token = self.cancel.child_token();
        if let Some(limit_ms) = time_limit {
            let deadline_token = work_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(limit_ms)).await;
                if !deadline_token.is_cancelled() {
                    warn!(workflow = %id, "workflow deadline reached");
                    deadline_token.cancel();
                }
            });
        }

        let phases_result = self.drive_phases(id, &work_token).await;

        let user_cancelled = self.cancel.is_cancelled();
        let deadline_hit = !user_cancelled && work_token.is_cancelled();

        let final_status = {
            let Ok(mut workflow) = self.state.write() else {
                return;
            };
            workflow.ended_at = Some(Utc::now());
            match &phases_result {
                _ if user_cancelled => {
                    workflow.status = WorkflowStatus::Cancelled;
                }
                Err(e) => {
                    workflow.status = WorkflowStatus::Failed;
                    workflow.error = Some(e.to_string());
                }
                Ok(()) => {
                    workflow.status = WorkflowStatus::Completed;
                    workflow.truncated = deadline_hit;
                }
            }
            workflow.status
        };

        match final_status {
            WorkflowStatus::Cancelled => {
                // Pending approvals may have been posted after cancel().
                self.approvals.deny_workflow(id, "workflow cancelled");
                self.bus.publish(id, EventKind::WorkflowCancelled);
            }
            WorkflowStatus::Failed => {
                let error = self
                    .state
                    .read()
                    .ok()
                    .and_then(|w| w.error.clone())
                    .unwrap_or_default();
                error!(workflow = %id, %error, "workflow failed");
                self.bus.publish(id, EventKind::WorkflowFailed { error });
            }
            _ => {
                self.bus.publish(
                    id,
                    EventKind::WorkflowCompleted {
                        truncated: deadline_hit,
                    },
                );
            }
        }

        self.persist_record(id);
    }

    /// Drive phases in order until the machine stops or work is cancelled.
    async fn drive_phases(&self, id: WorkflowId, work_token: &CancellationToken) -> anyhow::Result<()> {
        let tree_executor = TreeExecutor::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.planner),
            self.bus.clone(),
            self.poll_interval,
        );

        let mut phase = self.discovery.initial();
        loop {
            if work_token.is_cancelled() {
                return Ok(());
            }

            self.bus.publish(id, EventKind::PhaseStart { phase });
            let phase_started = Utc::now();
            {
                let mut workflow = write_state(&self.state)?;
                workflow.phase = phase;
            }

            let ctx = self.strategy_context(phase)?;
            let outcome = self.planner.plan(&ctx).await;

            let mut tree = TestTree::from_strategy(&outcome.strategy);
            // Constraint-filtered auth candidates still enter the tree;
            // the restraint layer gates them through the approval path.
            for step in outcome.approval_candidates {
                tree.insert_step(step);
            }

            let record = tree_executor.run(tree, &ctx, work_token).await;

            let gated_steps_present = record.nodes.values().any(is_gated);
            let approval_obtained = record
                .nodes
                .values()
                .any(|n| is_gated(n) && n.status == NodeStatus::Completed);
            let phase_findings = record.findings.clone();

            {
                let mut workflow = write_state(&self.state)?;
                workflow.findings.extend(record.findings.iter().cloned());
                workflow.phases.push(PhaseRecord {
                    phase,
                    started_at: phase_started,
                    ended_at: Some(Utc::now()),
                    reasoning: outcome.strategy.reasoning.clone(),
                    results: record.history.clone(),
                    summary: FindingSummary::from_findings(&record.findings),
                    proceed: false,
                });
            }

            let transition = TransitionContext {
                phase_findings: &phase_findings,
                approval_obtained,
                gated_steps_present,
            };
            let next = self.discovery.next_phase(
                phase,
                &ctx.constraints,
                &transition,
            );

            {
                let mut workflow = write_state(&self.state)?;
                if let Some(last) = workflow.phases.last_mut() {
                    last.proceed = next.is_some();
                }
            }

            self.bus.publish(
                id,
                EventKind::PhaseComplete {
                    phase,
                    findings: phase_findings.len(),
                    proceed: next.is_some(),
                },
            );

            match next {
                Some(next_phase) if !work_token.is_cancelled() => phase = next_phase,
                _ => return Ok(()),
            }
        }
    }

    /// Build the planner context from the current workflow state.
    fn strategy_context(&self, phase: Phase) -> anyhow::Result<StrategyContext> {
        let workflow = self
            .state
            .read()
            .map_err(|_| anyhow::anyhow!("workflow state poisoned"))?;
        Ok(StrategyContext {
            workflow_id: workflow.id,
            target: workflow.target.clone(),
            user_intent: workflow.intent.clone(),
            current_findings: workflow.findings.clone(),
            completed_tests: workflow
                .phases
                .iter()
                .flat_map(|p| p.results.iter().cloned())
                .collect(),
            phase,
            constraints: workflow.constraints.clone(),
        })
    }

    /// Persist the final workflow record as JSON next to the audit log.
    fn persist_record(&self, id: WorkflowId) {
        let Ok(workflow) = self.state.read() else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(&self.record_dir) {
            error!(workflow = %id, error = %e, "cannot create record directory");
            return;
        }
        let path = self.record_dir.join(format!("{id}.workflow.json"));
        match serde_json::to_vec_pretty(&*workflow) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    error!(workflow = %id, error = %e, "failed to persist workflow record");
                } else {
                    info!(workflow = %id, path = %path.display(), "workflow record persisted");
                }
            }
            Err(e) => error!(workflow = %id, error = %e, "failed to serialize workflow record"),
        }
    }
}

/// A node counts as gated when it needs auth or is critical priority.
fn is_gated(node: &TestNode) -> bool {
    node.priority == NodePriority::Critical
        || node
            .safety_checks
            .iter()
            .any(|t| t == TestNode::REQUIRES_AUTH_TAG)
}

fn write_state(state: &Arc<RwLock<Workflow>>) -> anyhow::Result<std::sync::RwLockWriteGuard<'_, Workflow>> {
    state
        .write()
        .map_err(|_| anyhow::anyhow!("workflow state poisoned"))
}

fn snapshot_of(workflow: &Workflow) -> WorkflowSnapshot {
    let finished = workflow.phases.len().min(3);
    #[allow(clippy::cast_precision_loss)]
    let progress = match workflow.status {
        WorkflowStatus::Completed
        | WorkflowStatus::Failed
        | WorkflowStatus::Cancelled => 1.0,
        _ => (finished as f64) / 3.0,
    };
    WorkflowSnapshot {
        id: workflow.id,
        status: workflow.status,
        phase: workflow.phase,
        progress,
        partial_results: workflow.findings.clone(),
        truncated: workflow.truncated,
    }
}

/// Accept a URL with a host, or a bare host name.
fn validate_target(target: &str) -> Result<String, SubmitError> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(SubmitError::InvalidTarget("empty target".to_owned()));
    }

    if let Ok(url) = Url::parse(trimmed) {
        if url.host_str().is_some() {
            return Ok(trimmed.to_owned());
        }
        return Err(SubmitError::InvalidTarget(format!(
            "'{trimmed}' has no host"
        )));
    }

    // Bare host: must parse once a scheme is prepended.
    match Url::parse(&format!("https://{trimmed}")) {
        Ok(url) if url.host_str().is_some() && !trimmed.contains(' ') => Ok(trimmed.to_owned()),
        _ => Err(SubmitError::InvalidTarget(format!(
            "'{trimmed}' is not a URL or host"
        ))),
    }
}

fn validate_constraints(constraints: &Constraints) -> Result<(), SubmitError> {
    if constraints.time_limit == Some(0) {
        return Err(SubmitError::InvalidConstraints(
            "timeLimit must be positive".to_owned(),
        ));
    }
    if constraints.min_tests_per_phase > MAX_MIN_TESTS_PER_PHASE {
        return Err(SubmitError::InvalidConstraints(format!(
            "minTestsPerPhase exceeds the ceiling of {MAX_MIN_TESTS_PER_PHASE}"
        )));
    }
    Ok(())
}
