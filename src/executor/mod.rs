//! Execution engine: containerized tool invocation with safety restraints.
//!
//! Every externally observable action of the orchestrator flows through
//! [`ExecutionEngine::execute`]. The pipeline is: catalogue lookup,
//! restraint evaluation (with the human-approval gate), target
//! normalization, wordlist resolution, parameter normalization, argv
//! validation, image preparation, and finally a hardened container run
//! bounded by the per-tool and per-request deadlines. A global semaphore
//! caps in-flight container executions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::{
    ApprovalContext, ApprovalMetadata, ApprovalOutcome, ApprovalQueue, ApprovalRequest,
    ApprovalType,
};
use crate::audit::{
    AuditLevel, DecisionEntry, DecisionLog, DecisionMetadata, DecisionOutput, DecisionType,
};
use crate::catalog::{ToolCatalog, ToolSpec};
use crate::config::{EngineConfig, SandboxConfig};
use crate::events::{EventBus, EventKind};
use crate::restraint::{CandidateTest, RestraintDecision, RestraintEngine};
use crate::types::{Constraints, Finding, NodePriority, Phase, WorkflowId};

pub mod docker;
pub mod parsers;
pub mod wordlist;

use wordlist::{Resolution, WordlistResolver};

/// Error raised by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime daemon is unreachable or misbehaving.
    #[error("container runtime error: {0}")]
    Infrastructure(String),
    /// The requested image could not be obtained.
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),
}

/// One demultiplexed chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// A stdout fragment.
    Stdout(String),
    /// A stderr fragment.
    Stderr(String),
}

/// Attached output streams of a running container.
pub struct AttachedOutput {
    /// Demultiplexed output; closes when the container exits.
    pub rx: mpsc::Receiver<OutputChunk>,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerState {
    /// Whether the container is still running.
    pub running: bool,
    /// Exit code, when exited.
    pub exit_code: Option<i64>,
}

/// A bind mount for a container.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host path.
    pub host: String,
    /// Container path.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Full command line.
    pub argv: Vec<String>,
    /// Bind mounts (wordlists are read-only).
    pub binds: Vec<BindMount>,
    /// Memory cap in bytes.
    pub memory_bytes: i64,
    /// CPU quota in nano CPUs.
    pub nano_cpus: i64,
    /// Remove the container automatically on exit.
    pub auto_remove: bool,
}

/// Abstract container runtime: the only side-effect boundary.
///
/// The default implementation targets an OCI-compatible daemon via
/// bollard ([`docker::DockerRuntime`]); tests supply an in-process fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image if it is not available locally.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;
    /// Create a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    /// Attach to the container's demultiplexed output streams.
    async fn attach(&self, id: &str) -> Result<AttachedOutput, RuntimeError>;
    /// Start a created container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    /// Inspect container state.
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;
    /// Kill a running container.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;
    /// Remove a container (idempotent; ignores already-gone).
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// A request to execute one tool invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Catalogue tool name.
    pub tool: String,
    /// Tool parameters (may include an array `target`).
    pub parameters: serde_json::Map<String, Value>,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Phase the request belongs to (approval context).
    pub phase: Phase,
    /// Scheduling priority.
    pub priority: NodePriority,
    /// Per-request timeout override; capped by the catalogue ceiling.
    pub timeout: Option<Duration>,
    /// Safety tags carried from the planner.
    pub safety_checks: Vec<String>,
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The tool ran and output was collected.
    Completed,
    /// The tool failed, timed out, or was cancelled.
    Failed,
    /// Restraint or approval prevented the run.
    Skipped,
}

/// Result of one execution request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Engine-assigned request id (correlates start/complete events).
    pub request_id: String,
    /// Tool that was (or was not) run.
    pub tool: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Collected output, bounded.
    pub output: String,
    /// Findings parsed from the output.
    pub findings: Vec<Finding>,
    /// Error or skip reason.
    pub error: Option<String>,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecutionResult {
    fn skipped(request_id: String, tool: &str, reason: String) -> Self {
        Self {
            request_id,
            tool: tool.to_owned(),
            status: ExecutionStatus::Skipped,
            output: String::new(),
            findings: Vec::new(),
            error: Some(reason),
            duration: Duration::ZERO,
        }
    }

    fn failed(request_id: String, tool: &str, reason: String, duration: Duration) -> Self {
        Self {
            request_id,
            tool: tool.to_owned(),
            status: ExecutionStatus::Failed,
            output: String::new(),
            findings: Vec::new(),
            error: Some(reason),
            duration,
        }
    }
}

/// Bound on output retained per invocation.
const MAX_OUTPUT_BYTES: usize = 1_048_576;

/// The containerized tool execution engine.
pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<ToolCatalog>,
    restraint: RestraintEngine,
    approvals: ApprovalQueue,
    bus: EventBus,
    log: Arc<DecisionLog>,
    semaphore: Arc<Semaphore>,
    wordlists: WordlistResolver,
    sandbox: SandboxConfig,
    default_timeout: Duration,
    min_per_target_timeout: Duration,
}

impl ExecutionEngine {
    /// Assemble the engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<ToolCatalog>,
        restraint: RestraintEngine,
        approvals: ApprovalQueue,
        bus: EventBus,
        log: Arc<DecisionLog>,
        engine_config: &EngineConfig,
        sandbox: SandboxConfig,
        wordlists: WordlistResolver,
    ) -> Self {
        Self {
            runtime,
            catalog,
            restraint,
            approvals,
            bus,
            log,
            semaphore: Arc::new(Semaphore::new(engine_config.max_concurrency.max(1))),
            wordlists,
            sandbox,
            default_timeout: Duration::from_secs(engine_config.default_timeout_secs),
            min_per_target_timeout: Duration::from_secs(
                engine_config.min_per_target_timeout_secs,
            ),
        }
    }

    /// Permits currently available (tests and status).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Execute one request through the full safety pipeline.
    ///
    /// Never returns an error: every failure mode is captured in the
    /// result's status so the tree can apply its retry policy uniformly.
    pub async fn execute(
        &self,
        mut request: ExecutionRequest,
        constraints: &Constraints,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let request_id = Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();

        // Step 1: catalogue lookup.
        let Some(spec) = self.catalog.get(&request.tool).cloned() else {
            return ExecutionResult::failed(
                request_id,
                &request.tool,
                format!("tool '{}' not in catalogue", request.tool),
                Duration::ZERO,
            );
        };

        // Step 2: restraint evaluation and the approval gate. Both run
        // before a semaphore permit is taken so a waiting approval never
        // starves actual executions.
        let target_str = primary_target(&request.parameters);
        let decision = {
            let candidate = CandidateTest {
                tool: &request.tool,
                target: &target_str,
                parameters: &request.parameters,
                priority: request.priority,
                safety_checks: &request.safety_checks,
            };
            self.restraint.evaluate(&candidate, constraints)
        };

        match decision {
            RestraintDecision::Approve => {}
            RestraintDecision::ApproveWithMitigations(mitigations) => {
                self.log_restraint(&request, "mitigated", &mitigations);
                for (key, value) in mitigations {
                    request.parameters.insert(key, value);
                }
            }
            RestraintDecision::Deny { reason } => {
                self.log_restraint_denial(&request, &reason);
                return ExecutionResult::skipped(request_id, &request.tool, reason);
            }
            RestraintDecision::RequireApproval { severity, reason } => {
                match self
                    .await_approval(&request, &target_str, severity, reason, constraints, cancel)
                    .await
                {
                    ApprovalOutcome::Approved { approver, .. } => {
                        info!(tool = %request.tool, %approver, "gated execution approved");
                    }
                    ApprovalOutcome::Denied { approver, reason } => {
                        return ExecutionResult::skipped(
                            request_id,
                            &request.tool,
                            format!("denied by {approver}: {reason}"),
                        );
                    }
                    ApprovalOutcome::TimedOut => {
                        return ExecutionResult::skipped(
                            request_id,
                            &request.tool,
                            "request timed out".to_owned(),
                        );
                    }
                }
            }
        }

        // Step 3: target normalization, including array fan-out.
        let targets = normalize_targets(&mut request.parameters, &request.tool);

        // Step 4: wordlist resolution.
        self.resolve_wordlist(&mut request, &request_id);

        // Step 5: parameter normalization against the catalogue.
        self.normalize_parameters(&mut request, &spec);

        // Effective deadline: request override capped by the tool ceiling.
        let ceiling = Duration::from_millis(spec.max_timeout_ms);
        let effective = request
            .timeout
            .unwrap_or(self.default_timeout)
            .min(ceiling);

        self.bus.publish(
            request.workflow_id,
            EventKind::ExecutionStart {
                request_id: request_id.clone(),
                tool: request.tool.clone(),
            },
        );

        let outcome = self
            .run_all_targets(&request, &spec, targets, effective, cancel)
            .await;

        let duration = started.elapsed();
        let result = match outcome {
            Ok((output, exit_ok)) => {
                let findings = parsers::parse_findings(&request.tool, &output, &target_str);
                if !exit_ok {
                    warn!(tool = %request.tool, "tool exited non-zero; using collected output");
                }
                ExecutionResult {
                    request_id: request_id.clone(),
                    tool: request.tool.clone(),
                    status: ExecutionStatus::Completed,
                    output,
                    findings,
                    error: None,
                    duration,
                }
            }
            Err(reason) => {
                ExecutionResult::failed(request_id.clone(), &request.tool, reason, duration)
            }
        };

        match result.status {
            ExecutionStatus::Completed => self.bus.publish(
                request.workflow_id,
                EventKind::ExecutionComplete {
                    request_id: request_id.clone(),
                    duration_ms: duration_ms(duration),
                },
            ),
            _ => self.bus.publish(
                request.workflow_id,
                EventKind::ExecutionFailed {
                    request_id: request_id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                },
            ),
        }

        self.log.record(DecisionEntry::new(
            request.workflow_id,
            DecisionType::Execution,
            serde_json::json!({ "tool": request.tool, "target": target_str }),
            DecisionOutput {
                decision: match result.status {
                    ExecutionStatus::Completed => "completed".to_owned(),
                    ExecutionStatus::Failed => "failed".to_owned(),
                    ExecutionStatus::Skipped => "skipped".to_owned(),
                },
                reasoning: result.error.clone().unwrap_or_default(),
                confidence: 1.0,
            },
            DecisionMetadata {
                model: None,
                latency_ms: Some(duration_ms(duration)),
                tool: Some(request.tool.clone()),
                level: if result.status == ExecutionStatus::Completed {
                    AuditLevel::Info
                } else {
                    AuditLevel::Warning
                },
            },
        ));

        result
    }

    /// Run the tool once per target, dividing the deadline evenly.
    ///
    /// Returns concatenated output and whether every invocation exited
    /// cleanly.
    async fn run_all_targets(
        &self,
        request: &ExecutionRequest,
        spec: &ToolSpec,
        targets: Vec<String>,
        effective: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), String> {
        let count = targets.len().max(1);
        let per_target = if count > 1 {
            let divided = effective
                .checked_div(u32::try_from(count).unwrap_or(u32::MAX))
                .unwrap_or(self.min_per_target_timeout);
            divided.max(self.min_per_target_timeout)
        } else {
            effective
        };

        let mut combined = String::new();
        let mut all_clean = true;
        for target in targets {
            let mut parameters = request.parameters.clone();
            parameters.insert("target".to_owned(), Value::String(target));
            let argv = self.validated_argv(spec, &parameters);

            let (output, exit_ok) = self
                .run_container(request, spec, argv, per_target, cancel)
                .await?;
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&output);
            all_clean = all_clean && exit_ok;
        }
        Ok((combined, all_clean))
    }

    /// One hardened container run under the semaphore.
    async fn run_container(
        &self,
        request: &ExecutionRequest,
        spec: &ToolSpec,
        argv: Vec<String>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), String> {
        // Step 7: image preparation.
        if self.sandbox.auto_pull {
            self.runtime
                .pull(&spec.image)
                .await
                .map_err(|e| e.to_string())?;
        }

        let container_spec = self.container_spec(spec, argv);

        // In-flight cap applies to the container run itself.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| "engine shut down".to_owned())?;

        let id = self
            .runtime
            .create(&container_spec)
            .await
            .map_err(|e| e.to_string())?;

        let mut attached = self
            .runtime
            .attach(&id)
            .await
            .map_err(|e| e.to_string())?;

        if let Err(e) = self.runtime.start(&id).await {
            let _ = self.runtime.remove(&id).await;
            return Err(e.to_string());
        }

        info!(tool = %request.tool, container = %id, timeout_ms = duration_ms(deadline), "container started");

        let mut output = String::new();
        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        let ended = loop {
            tokio::select! {
                chunk = attached.rx.recv() => match chunk {
                    Some(OutputChunk::Stdout(text)) | Some(OutputChunk::Stderr(text)) => {
                        if output.len() < MAX_OUTPUT_BYTES {
                            output.push_str(&text);
                        }
                    }
                    None => break Ok(()),
                },
                () = &mut deadline_sleep => {
                    break Err("execution timeout".to_owned());
                }
                () = cancel.cancelled() => {
                    break Err("cancelled".to_owned());
                }
            }
        };

        match ended {
            Ok(()) => {
                let state = self
                    .runtime
                    .inspect(&id)
                    .await
                    .unwrap_or(ContainerState::default());
                // AutoRemove reaps exited containers; this is a no-op then.
                let _ = self.runtime.remove(&id).await;
                let exit_ok = state.exit_code.unwrap_or(0) == 0;
                Ok((output, exit_ok))
            }
            Err(reason) => {
                // Never leave a container running past its node.
                let _ = self.runtime.kill(&id).await;
                let _ = self.runtime.remove(&id).await;
                Err(reason)
            }
        }
    }

    /// Build the container spec with the sandbox hardening defaults.
    fn container_spec(&self, spec: &ToolSpec, argv: Vec<String>) -> ContainerSpec {
        let memory_bytes = i64::from(self.sandbox.memory_mb)
            .saturating_mul(1024)
            .saturating_mul(1024);
        let nano_cpus = docker::f64_to_nano_cpu(self.sandbox.cpu_cores).unwrap_or(800_000_000);

        // The wordlist mount always binds the configured host directory,
        // whatever host path the catalogue entry was authored with.
        let binds = spec
            .mounts
            .iter()
            .map(|m| BindMount {
                host: if m.container == self.wordlists.mount_root() {
                    self.wordlists.host_root().to_string_lossy().into_owned()
                } else {
                    m.host.clone()
                },
                container: m.container.clone(),
                read_only: m.read_only,
            })
            .collect();

        ContainerSpec {
            image: spec.image.clone(),
            argv,
            binds,
            memory_bytes,
            nano_cpus,
            auto_remove: true,
        }
    }

    /// Steps 5 and 6: inject defaults, prune unknowns, build + vet argv.
    fn normalize_parameters(&self, request: &mut ExecutionRequest, spec: &ToolSpec) {
        for (key, value) in &spec.default_params {
            if !request.parameters.contains_key(key) {
                request.parameters.insert(key.clone(), value.clone());
            }
        }

        if !self.catalog.is_permissive() {
            let unknown: Vec<String> = request
                .parameters
                .keys()
                .filter(|k| !spec.allowed_params.iter().any(|a| a == *k))
                .cloned()
                .collect();
            for key in unknown {
                warn!(tool = %request.tool, param = %key, "rejecting unknown parameter");
                request.parameters.remove(&key);
            }
        }

        for required in &spec.required_params {
            if !request.parameters.contains_key(required) {
                warn!(tool = %request.tool, param = %required, "required parameter missing");
            }
        }
    }

    /// Build argv and drop flags outside the catalogue's allow-list.
    fn validated_argv(
        &self,
        spec: &ToolSpec,
        parameters: &serde_json::Map<String, Value>,
    ) -> Vec<String> {
        let argv = spec.build_argv(parameters);
        let permitted = spec.permitted_flags();

        let mut vetted: Vec<String> = Vec::with_capacity(argv.len());
        for token in argv {
            if token.starts_with('-') {
                let flag = token.split('=').next().unwrap_or(&token);
                let forbidden = spec.forbidden_flags.iter().any(|f| f == flag);
                let allowed = permitted.contains(&flag);
                if forbidden || !allowed {
                    warn!(tool = %spec.name, %token, "dropping disallowed flag");
                    continue;
                }
            }
            vetted.push(token);
        }
        vetted
    }

    /// Step 4: substitute a dead wordlist path with a live candidate.
    fn resolve_wordlist(&self, request: &mut ExecutionRequest, request_id: &str) {
        let Some(Value::String(requested)) = request.parameters.get("wordlist").cloned() else {
            return;
        };
        match self.wordlists.resolve(&requested) {
            Resolution::Unchanged => {}
            Resolution::Substituted(replacement) => {
                warn!(
                    tool = %request.tool,
                    requested = %requested,
                    replacement = %replacement,
                    "wordlist not found, substituting"
                );
                self.log.record(DecisionEntry::new(
                    request.workflow_id,
                    DecisionType::Execution,
                    serde_json::json!({ "requestId": request_id, "requestedWordlist": requested }),
                    DecisionOutput {
                        decision: "wordlist-substituted".to_owned(),
                        reasoning: format!("'{requested}' absent; using '{replacement}'"),
                        confidence: 1.0,
                    },
                    DecisionMetadata {
                        tool: Some(request.tool.clone()),
                        level: AuditLevel::Warning,
                        ..DecisionMetadata::default()
                    },
                ));
                request
                    .parameters
                    .insert("wordlist".to_owned(), Value::String(replacement));
            }
            Resolution::Unresolvable => {
                warn!(tool = %request.tool, requested = %requested, "no wordlist candidate found");
            }
        }
    }

    /// Post an approval request and await its resolution.
    async fn await_approval(
        &self,
        request: &ExecutionRequest,
        target: &str,
        severity: crate::types::Severity,
        reason: String,
        constraints: &Constraints,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        let approval = ApprovalRequest::new(
            request.workflow_id,
            ApprovalType::TestExecution,
            ApprovalContext {
                target: target.to_owned(),
                test: request.tool.clone(),
                phase: request.phase,
                environment: constraints.environment,
                severity,
                reason,
            },
            ApprovalMetadata {
                controls: request.safety_checks.clone(),
                owasp_categories: vec![],
                impact: None,
            },
            self.approvals.default_timeout(),
        );

        let rx = self.approvals.submit(approval);
        tokio::select! {
            outcome = rx => outcome.unwrap_or(ApprovalOutcome::TimedOut),
            () = cancel.cancelled() => ApprovalOutcome::Denied {
                approver: "system".to_owned(),
                reason: "workflow cancelled".to_owned(),
            },
        }
    }

    fn log_restraint(
        &self,
        request: &ExecutionRequest,
        decision: &str,
        mitigations: &serde_json::Map<String, Value>,
    ) {
        self.log.record(DecisionEntry::new(
            request.workflow_id,
            DecisionType::Restraint,
            serde_json::json!({ "tool": request.tool }),
            DecisionOutput {
                decision: decision.to_owned(),
                reasoning: serde_json::to_string(mitigations).unwrap_or_default(),
                confidence: 1.0,
            },
            DecisionMetadata {
                tool: Some(request.tool.clone()),
                ..DecisionMetadata::default()
            },
        ));
    }

    fn log_restraint_denial(&self, request: &ExecutionRequest, reason: &str) {
        self.log.record(DecisionEntry::new(
            request.workflow_id,
            DecisionType::Restraint,
            serde_json::json!({ "tool": request.tool }),
            DecisionOutput {
                decision: "denied".to_owned(),
                reasoning: reason.to_owned(),
                confidence: 1.0,
            },
            DecisionMetadata {
                tool: Some(request.tool.clone()),
                level: AuditLevel::Warning,
                ..DecisionMetadata::default()
            },
        ));
    }
}

/// The request's primary target as a display string.
fn primary_target(parameters: &serde_json::Map<String, Value>) -> String {
    match parameters.get("target") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        _ => String::new(),
    }
}

/// Step 3: repair malformed schemes and expand array targets.
///
/// A string target with a duplicated scheme (`https://https://x`) is
/// collapsed to a single scheme. An array target fans out for the
/// multi-target tool set and collapses to its first element otherwise.
fn normalize_targets(
    parameters: &mut serde_json::Map<String, Value>,
    tool: &str,
) -> Vec<String> {
    match parameters.get("target").cloned() {
        Some(Value::String(s)) => {
            let fixed = normalize_scheme(&s);
            parameters.insert("target".to_owned(), Value::String(fixed.clone()));
            vec![fixed]
        }
        Some(Value::Array(items)) => {
            let cleaned: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(normalize_scheme)
                .filter(|s| !s.is_empty())
                .collect();
            if cleaned.is_empty() {
                parameters.remove("target");
                return vec![String::new()];
            }
            if ToolCatalog::is_multi_target(tool) {
                parameters.insert(
                    "target".to_owned(),
                    Value::String(cleaned[0].clone()),
                );
                cleaned
            } else {
                let first = cleaned[0].clone();
                parameters.insert("target".to_owned(), Value::String(first.clone()));
                vec![first]
            }
        }
        _ => vec![String::new()],
    }
}

/// Collapse repeated URL schemes to a single one.
fn normalize_scheme(target: &str) -> String {
    let mut rest = target;
    let mut scheme = None;
    loop {
        if let Some(stripped) = rest.strip_prefix("https://") {
            scheme.get_or_insert("https://");
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("http://") {
            scheme.get_or_insert("http://");
            rest = stripped;
        } else {
            break;
        }
    }
    match scheme {
        Some(scheme) => format!("{scheme}{rest}"),
        None => rest.to_owned(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
