//! End-to-end scenarios over an in-process container runtime and a
//! scripted planner provider. No Docker daemon or network is required.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use armitage::approval::ApprovalQueue;
use armitage::audit::DecisionLog;
use armitage::catalog::ToolCatalog;
use armitage::config::{EngineConfig, SandboxConfig};
use armitage::discovery::ProgressiveDiscovery;
use armitage::events::{EventBus, EventKind};
use armitage::executor::wordlist::WordlistResolver;
use armitage::executor::{
    AttachedOutput, ContainerRuntime, ContainerSpec, ContainerState, ExecutionEngine,
    ExecutionRequest, ExecutionStatus, OutputChunk, RuntimeError,
};
use armitage::orchestrator::Orchestrator;
use armitage::planner::Planner;
use armitage::providers::{
    CompletionRequest, CompletionResponse, LlmProvider, ProviderError, TokenUsage,
};
use armitage::restraint::RestraintEngine;
use armitage::types::{Constraints, Environment, NodePriority, Phase, WorkflowStatus};

// ── In-process container runtime ────────────────────────────────

/// Scripted behavior for one image.
#[derive(Debug, Clone)]
struct Behavior {
    output: String,
    exit_code: i64,
    /// Hang until killed instead of exiting.
    hang: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            output: String::new(),
            exit_code: 0,
            hang: false,
        }
    }
}

struct MockContainer {
    behavior: Behavior,
    kill: CancellationToken,
}

/// Container runtime fake: replays scripted output per image.
#[derive(Default)]
struct MockRuntime {
    behaviors: Mutex<HashMap<String, Behavior>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    /// Created specs in creation order, for argv assertions.
    specs: Mutex<Vec<ContainerSpec>>,
    kills: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl MockRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, image: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .expect("behaviors lock")
            .insert(image.to_owned(), behavior);
    }

    fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().expect("specs lock").clone()
    }

    fn kill_count(&self) -> usize {
        self.kills.lock().expect("kills lock").len()
    }

    fn peak_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let behavior = self
            .behaviors
            .lock()
            .expect("behaviors lock")
            .get(&spec.image)
            .cloned()
            .unwrap_or_default();
        self.specs.lock().expect("specs lock").push(spec.clone());
        self.containers.lock().expect("containers lock").insert(
            id.clone(),
            MockContainer {
                behavior,
                kill: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn attach(&self, id: &str) -> Result<AttachedOutput, RuntimeError> {
        let (behavior, kill) = {
            let containers = self.containers.lock().expect("containers lock");
            let container = containers
                .get(id)
                .ok_or_else(|| RuntimeError::Infrastructure("unknown container".to_owned()))?;
            (container.behavior.clone(), container.kill.clone())
        };

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let current = self.active.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.max_active.fetch_max(current, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));

        tokio::spawn(async move {
            let _guard = guard;
            if behavior.hang {
                kill.cancelled().await;
            } else {
                let _ = tx.send(OutputChunk::Stdout(behavior.output.clone())).await;
            }
            // Dropping tx closes the stream, signalling container exit.
        });

        Ok(AttachedOutput { rx })
    }

    async fn start(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let containers = self.containers.lock().expect("containers lock");
        let exit_code = containers.get(id).map(|c| c.behavior.exit_code);
        Ok(ContainerState {
            running: false,
            exit_code,
        })
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.kills.lock().expect("kills lock").push(id.to_owned());
        let containers = self.containers.lock().expect("containers lock");
        if let Some(container) = containers.get(id) {
            container.kill.cancel();
        }
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Decrements the shared active counter when a container task ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Scripted planner provider ───────────────────────────────────

struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Arc<dyn LlmProvider> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| (*s).to_owned()).collect()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let next = self.responses.lock().expect("responses lock").pop_front();
        match next {
            Some(text) => Ok(CompletionResponse {
                text,
                usage: Some(TokenUsage::default()),
                model: "scripted".to_owned(),
            }),
            None => Err(ProviderError::Unavailable("script exhausted".to_owned())),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

// ── Harness wiring ──────────────────────────────────────────────

struct Harness {
    runtime: Arc<MockRuntime>,
    engine: Arc<ExecutionEngine>,
    approvals: ApprovalQueue,
    bus: EventBus,
    planner: Arc<Planner>,
    _audit_dir: tempfile::TempDir,
    audit_path: std::path::PathBuf,
}

fn harness(provider: Option<Arc<dyn LlmProvider>>, max_concurrency: usize) -> Harness {
    harness_with_catalog(provider, max_concurrency, Arc::new(ToolCatalog::builtin()))
}

fn harness_with_catalog(
    provider: Option<Arc<dyn LlmProvider>>,
    max_concurrency: usize,
    catalog: Arc<ToolCatalog>,
) -> Harness {
    let audit_dir = tempfile::tempdir().expect("tempdir");
    let audit_path = audit_dir.path().to_path_buf();
    let bus = EventBus::default();
    let log = Arc::new(DecisionLog::new(audit_dir.path()).expect("decision log"));
    let approvals = ApprovalQueue::new(
        bus.clone(),
        vec!["security-lead".to_owned()],
        Duration::from_millis(400),
    );
    let runtime = MockRuntime::new();

    let engine_config = EngineConfig {
        max_concurrency,
        default_timeout_secs: 5,
        min_per_target_timeout_secs: 1,
        poll_interval_ms: 20,
    };
    let wordlist_host = audit_dir.path().join("wordlists");
    std::fs::create_dir_all(wordlist_host.join("Discovery/Web-Content")).expect("mkdirs");
    std::fs::write(
        wordlist_host.join("Discovery/Web-Content/common.txt"),
        "admin\n",
    )
    .expect("seed wordlist");

    let engine = Arc::new(ExecutionEngine::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&catalog),
        RestraintEngine::with_defaults(),
        approvals.clone(),
        bus.clone(),
        Arc::clone(&log),
        &engine_config,
        SandboxConfig::default(),
        WordlistResolver::new("/wordlists", wordlist_host),
    ));

    let planner = Arc::new(Planner::new(
        provider,
        catalog,
        "/wordlists",
        log,
        Duration::from_secs(2),
        2048,
    ));

    Harness {
        runtime,
        engine,
        approvals,
        bus,
        planner,
        _audit_dir: audit_dir,
        audit_path,
    }
}

fn orchestrator(h: &Harness) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(&h.planner),
        Arc::clone(&h.engine),
        h.approvals.clone(),
        ProgressiveDiscovery::default(),
        h.bus.clone(),
        Duration::from_millis(20),
        h.audit_path.clone(),
    )
}

fn request(tool: &str, target: &str) -> ExecutionRequest {
    let mut parameters = serde_json::Map::new();
    parameters.insert(
        "target".to_owned(),
        serde_json::Value::String(target.to_owned()),
    );
    ExecutionRequest {
        tool: tool.to_owned(),
        parameters,
        workflow_id: uuid::Uuid::new_v4(),
        phase: Phase::Recon,
        priority: NodePriority::Medium,
        timeout: None,
        safety_checks: vec![],
    }
}

async fn wait_terminal(orchestrator: &Orchestrator, id: armitage::types::WorkflowId) -> WorkflowStatus {
    for _ in 0..600 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(snapshot) = orchestrator.status(id) {
            if snapshot.status.is_terminal() {
                return snapshot.status;
            }
        }
    }
    panic!("workflow {id} never reached a terminal state");
}

// ── Scenario A: subdomain discovery expansion ───────────────────

#[tokio::test]
async fn subdomain_findings_expand_into_per_host_coverage() {
    let provider = ScriptedProvider::new(&[r#"{
        "phase": "analyze",
        "reasoning": "inspect each discovered host",
        "recommendations": [
            {"id": "seed", "tool": "header-analyzer", "parameters": {"target": "https://example.test"}}
        ],
        "confidenceLevel": 0.8
    }"#]);
    let h = harness(Some(provider), 3);

    let subdomains = ["a.example.test", "b.example.test", "c.example.test"];
    let findings: Vec<armitage::types::Finding> = subdomains
        .iter()
        .map(|host| armitage::types::Finding {
            kind: "subdomain".to_owned(),
            severity: armitage::types::Severity::Info,
            confidence: 0.95,
            target: (*host).to_owned(),
            data: serde_json::json!({ "host": host }),
            tool: "subdomain-scanner".to_owned(),
            timestamp: chrono::Utc::now(),
        })
        .collect();

    let ctx = armitage::planner::StrategyContext {
        workflow_id: uuid::Uuid::new_v4(),
        target: "https://example.test".to_owned(),
        user_intent: "test subdomains".to_owned(),
        current_findings: findings,
        completed_tests: vec![],
        phase: Phase::Analyze,
        constraints: Constraints {
            use_seclists_wordlists: true,
            ..Constraints::default()
        },
    };

    let outcome = h.planner.plan(&ctx).await;
    assert!(!outcome.fell_back);

    let mut ids = std::collections::HashSet::new();
    for step in &outcome.strategy.recommendations {
        assert!(ids.insert(step.id.clone()), "duplicate id {}", step.id);
    }
    for tool in ["directory-bruteforce", "port-scanner", "tech-fingerprint"] {
        for host in subdomains {
            assert!(
                outcome.strategy.recommendations.iter().any(|s| {
                    s.tool == tool
                        && s.parameters.get("target").and_then(|v| v.as_str()) == Some(host)
                }),
                "missing {tool} step for {host}"
            );
        }
    }
}

// ── Scenario B: wordlist fallback ───────────────────────────────

#[tokio::test]
async fn absent_wordlist_substitutes_first_existing_candidate() {
    let h = harness(None, 3);
    let mut req = request("directory-bruteforce", "https://example.test");
    req.parameters.insert(
        "wordlist".to_owned(),
        serde_json::Value::String(
            "/wordlists/Discovery/Web-Content/does-not-exist.txt".to_owned(),
        ),
    );

    let constraints = Constraints {
        use_seclists_wordlists: true,
        ..Constraints::default()
    };
    let result = h
        .engine
        .execute(req, &constraints, &CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Completed);

    let specs = h.runtime.created_specs();
    assert_eq!(specs.len(), 1);
    assert!(
        specs[0]
            .argv
            .iter()
            .any(|t| t == "/wordlists/Discovery/Web-Content/common.txt"),
        "argv must carry the substituted wordlist, got {:?}",
        specs[0].argv
    );

    // The substitution leaves a warning-level audit entry.
    let workflow_file = std::fs::read_dir(&h.audit_path)
        .expect("audit dir")
        .filter_map(Result::ok)
        .find(|e| e.path().extension().is_some_and(|x| x == "jsonl"))
        .expect("audit file written");
    let contents = std::fs::read_to_string(workflow_file.path()).expect("read audit");
    assert!(contents.contains("wordlist-substituted"));
    assert!(contents.contains("\"level\":\"warning\""));
}

// ── Scenario C: timeout enforcement ─────────────────────────────

#[tokio::test]
async fn tool_ceiling_bounds_request_timeout_and_kills_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog_path = dir.path().join("catalog.json");
    std::fs::write(
        &catalog_path,
        r#"[{
            "name": "slow-probe",
            "image": "slow:latest",
            "allowed_params": ["target"],
            "required_params": ["target"],
            "max_timeout_ms": 200,
            "argv": ["{target}"]
        }]"#,
    )
    .expect("write catalog");
    let catalog = Arc::new(ToolCatalog::load(Some(&catalog_path)).expect("load"));

    let h = harness_with_catalog(None, 3, catalog);
    h.runtime.script(
        "slow:latest",
        Behavior {
            hang: true,
            ..Behavior::default()
        },
    );

    let mut req = request("slow-probe", "https://example.test");
    req.timeout = Some(Duration::from_millis(120_000));

    let started = std::time::Instant::now();
    let result = h
        .engine
        .execute(req, &Constraints::default(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("execution timeout"));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the 200ms ceiling must win over the 120s request timeout"
    );
    assert_eq!(h.runtime.kill_count(), 1, "hung container must be killed");
}

// ── Scenario D: approval gating ─────────────────────────────────

#[tokio::test]
async fn denied_approval_skips_node_with_approver_in_reason() {
    let h = harness(None, 3);

    let mut req = request("header-analyzer", "https://example.test");
    req.safety_checks = vec!["requires-auth".to_owned()];
    let constraints = Constraints {
        environment: Environment::Production,
        requires_auth: false,
        ..Constraints::default()
    };

    let engine = Arc::clone(&h.engine);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(async move { engine.execute(req, &constraints, &cancel).await });

    // Wait for the pending approval to surface.
    let mut approval_id = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(pending) = h.approvals.list_pending().first().cloned() {
            approval_id = Some(pending.id);
            break;
        }
    }
    let approval_id = approval_id.expect("approval request posted");

    h.approvals
        .process(approval_id, false, "sec-lead", None, vec![])
        .expect("process decision");

    let result = task.await.expect("task");
    assert_eq!(result.status, ExecutionStatus::Skipped);
    let reason = result.error.expect("skip reason");
    assert!(
        reason.contains("sec-lead"),
        "skip reason must name the approver, got '{reason}'"
    );
    assert_eq!(h.runtime.created_specs().len(), 0, "nothing executed");
}

#[tokio::test]
async fn approval_timeout_skips_gated_node() {
    let h = harness(None, 3);

    let mut req = request("header-analyzer", "https://example.test");
    req.safety_checks = vec!["requires-auth".to_owned()];
    let constraints = Constraints {
        environment: Environment::Staging,
        ..Constraints::default()
    };

    // 400ms timeout, one escalation level: resolves in under ~1s.
    let result = h
        .engine
        .execute(req, &constraints, &CancellationToken::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Skipped);
    assert_eq!(result.error.as_deref(), Some("request timed out"));
}

// ── Scenario E: cancellation ────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_running_nodes_and_emits_one_event() {
    let h = harness(None, 3);
    // Fallback recon runs subdomain-scanner and port-scanner; both hang.
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            hang: true,
            ..Behavior::default()
        },
    );
    h.runtime.script(
        "instrumentisto/nmap:latest",
        Behavior {
            hang: true,
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let mut events = h.bus.subscribe();
    let id = orch
        .submit("https://example.test", "cancel me", Constraints::default())
        .expect("submit");

    // Wait until both tools are actually running.
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if h.runtime.created_specs().len() >= 2 {
            break;
        }
    }
    assert!(h.runtime.created_specs().len() >= 2, "nodes never started");

    assert!(orch.cancel(id));
    assert!(orch.cancel(id), "cancel is idempotent");

    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Cancelled);

    let mut cancelled_events = 0usize;
    while let Ok(event) = events.try_recv() {
        if matches!(event.kind, EventKind::WorkflowCancelled) {
            cancelled_events = cancelled_events.saturating_add(1);
        }
    }
    assert_eq!(cancelled_events, 1, "workflow:cancelled emitted exactly once");
    assert!(h.runtime.kill_count() >= 2, "running containers were killed");
}

// ── Scenario F: planner safety fallback end to end ──────────────

#[tokio::test]
async fn unsafe_strategy_falls_back_and_workflow_completes() {
    let provider = ScriptedProvider::new(&[r#"{
        "phase": "recon",
        "reasoning": "evil",
        "recommendations": [
            {"id": "evil", "tool": "backdoor-installer", "parameters": {"target": "x"}}
        ]
    }"#]);
    let h = harness(Some(provider), 3);
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            output: "a.example.test\n".to_owned(),
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let id = orch
        .submit("https://example.test", "full sweep", Constraints::default())
        .expect("submit");
    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // Only the deterministic fallback tools ran in recon.
    let specs = h.runtime.created_specs();
    assert!(specs
        .iter()
        .any(|s| s.image == "projectdiscovery/subfinder:latest"));
    assert!(!specs.iter().any(|s| s.image.contains("backdoor")));

    // The decision log records the fallback at confidence 0.5.
    let log_file = h.audit_path.join(format!("{id}.jsonl"));
    let contents = std::fs::read_to_string(log_file).expect("decision log");
    assert!(contents.contains("\"decision\":\"fallback\""));
    assert!(contents.contains("0.5"));
}

// ── Decision hook: add-children on array targets ────────────────

#[tokio::test]
async fn array_target_on_single_target_tool_splits_into_children() {
    let provider = ScriptedProvider::new(&[r#"{
        "phase": "recon",
        "reasoning": "check certificates on everything we find",
        "recommendations": [
            {"id": "subs", "tool": "subdomain-scanner", "parameters": {"target": "example.test"}},
            {"id": "certs", "tool": "ssl-checker", "dependsOn": ["subs"],
             "parameters": {"target": "{{subdomain-scanner.results}}"}}
        ],
        "confidenceLevel": 0.8
    }"#]);
    let h = harness(Some(provider), 3);
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            output: "a.example.test\nb.example.test\n".to_owned(),
            ..Behavior::default()
        },
    );
    h.runtime.script(
        "drwetter/testssl.sh:latest",
        Behavior {
            output: "TLS 1.3 ok\n".to_owned(),
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let id = orch
        .submit(
            "https://example.test",
            "certificate sweep",
            Constraints::default(),
        )
        .expect("submit");
    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // ssl-checker takes a single target: the decision hook must split the
    // substituted host list into one node per host.
    let ssl_targets: Vec<String> = h
        .runtime
        .created_specs()
        .iter()
        .filter(|s| s.image == "drwetter/testssl.sh:latest")
        .filter_map(|s| s.argv.last().cloned())
        .collect();
    assert_eq!(
        ssl_targets.len(),
        2,
        "split must cover every discovered host, got {ssl_targets:?}"
    );
    assert!(ssl_targets.contains(&"a.example.test".to_owned()));
    assert!(ssl_targets.contains(&"b.example.test".to_owned()));
}

// ── Invariants ──────────────────────────────────────────────────

#[tokio::test]
async fn semaphore_bounds_in_flight_executions() {
    let h = harness(None, 2);
    h.runtime.script(
        "curlimages/curl:latest",
        Behavior {
            output: "HTTP/1.1 200 OK\n".to_owned(),
            ..Behavior::default()
        },
    );

    let mut tasks = Vec::new();
    for i in 0..6 {
        let engine = Arc::clone(&h.engine);
        let req = request("header-analyzer", &format!("https://h{i}.example.test"));
        tasks.push(tokio::spawn(async move {
            engine
                .execute(req, &Constraints::default(), &CancellationToken::new())
                .await
        }));
    }
    for task in tasks {
        let result = task.await.expect("task");
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    assert!(
        h.runtime.peak_concurrency() <= 2,
        "peak concurrency {} exceeded the semaphore capacity",
        h.runtime.peak_concurrency()
    );
}

#[tokio::test]
async fn every_execution_start_has_exactly_one_terminal_event() {
    let h = harness(None, 3);
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            output: "a.example.test\nb.example.test\n".to_owned(),
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let mut events = h.bus.subscribe();
    let id = orch
        .submit("https://example.test", "sweep", Constraints::default())
        .expect("submit");
    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let mut starts: HashMap<String, usize> = HashMap::new();
    let mut ends: HashMap<String, usize> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        match event.kind {
            EventKind::ExecutionStart { request_id, .. } => {
                let slot = starts.entry(request_id).or_insert(0);
                *slot = slot.saturating_add(1);
            }
            EventKind::ExecutionComplete { request_id, .. }
            | EventKind::ExecutionFailed { request_id, .. } => {
                let slot = ends.entry(request_id).or_insert(0);
                *slot = slot.saturating_add(1);
            }
            _ => {}
        }
    }

    assert!(!starts.is_empty(), "no executions observed");
    for (request_id, count) in &starts {
        assert_eq!(*count, 1, "duplicate execution:start for {request_id}");
        assert_eq!(
            ends.get(request_id),
            Some(&1),
            "execution {request_id} must end exactly once"
        );
    }
    for request_id in ends.keys() {
        assert!(
            starts.contains_key(request_id),
            "end without start for {request_id}"
        );
    }
}

#[tokio::test]
async fn findings_accumulate_and_workflow_record_is_persisted() {
    let h = harness(None, 3);
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            output: "a.example.test\n".to_owned(),
            ..Behavior::default()
        },
    );
    h.runtime.script(
        "instrumentisto/nmap:latest",
        Behavior {
            output: "22/tcp open ssh\n80/tcp open http\n".to_owned(),
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let id = orch
        .submit("https://example.test", "sweep", Constraints::default())
        .expect("submit");
    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = orch.status(id).expect("snapshot");
    assert!(
        snapshot.partial_results.len() >= 3,
        "subdomain and port findings must aggregate, got {}",
        snapshot.partial_results.len()
    );
    assert!((snapshot.progress - 1.0).abs() < f64::EPSILON);

    let record_path = h.audit_path.join(format!("{id}.workflow.json"));
    let record = std::fs::read_to_string(record_path).expect("workflow record persisted");
    let parsed: serde_json::Value = serde_json::from_str(&record).expect("valid JSON");
    assert_eq!(parsed["status"], "completed");
    assert_eq!(parsed["target"], "https://example.test");
}

#[tokio::test]
async fn two_identical_submissions_get_distinct_workflows() {
    let h = harness(None, 3);
    let orch = orchestrator(&h);

    let first = orch
        .submit("https://example.test", "sweep", Constraints::default())
        .expect("first");
    let second = orch
        .submit("https://example.test", "sweep", Constraints::default())
        .expect("second");
    assert_ne!(first, second);

    assert_eq!(wait_terminal(&orch, first).await, WorkflowStatus::Completed);
    assert_eq!(wait_terminal(&orch, second).await, WorkflowStatus::Completed);
}

#[tokio::test]
async fn deadline_truncates_workflow_as_completed() {
    let h = harness(None, 3);
    // Both fallback recon tools hang; the deadline must reap them.
    h.runtime.script(
        "projectdiscovery/subfinder:latest",
        Behavior {
            hang: true,
            ..Behavior::default()
        },
    );
    h.runtime.script(
        "instrumentisto/nmap:latest",
        Behavior {
            hang: true,
            ..Behavior::default()
        },
    );

    let orch = orchestrator(&h);
    let constraints = Constraints {
        time_limit: Some(300),
        ..Constraints::default()
    };
    let id = orch
        .submit("https://example.test", "bounded sweep", constraints)
        .expect("submit");

    let status = wait_terminal(&orch, id).await;
    assert_eq!(status, WorkflowStatus::Completed);
    let snapshot = orch.status(id).expect("snapshot");
    assert!(snapshot.truncated, "deadline expiry must set the truncation flag");
}
