//! Armitage CLI: run a workflow to completion or inspect the catalogue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use armitage::approval::ApprovalQueue;
use armitage::audit::{spawn_audit_subscriber, DecisionLog};
use armitage::catalog::ToolCatalog;
use armitage::config::ArmitageConfig;
use armitage::discovery::{ProceedPolicy, ProgressiveDiscovery};
use armitage::events::EventBus;
use armitage::executor::docker::DockerRuntime;
use armitage::executor::wordlist::WordlistResolver;
use armitage::executor::ExecutionEngine;
use armitage::orchestrator::Orchestrator;
use armitage::planner::Planner;
use armitage::providers::anthropic::AnthropicProvider;
use armitage::providers::LlmProvider;
use armitage::restraint::RestraintEngine;
use armitage::types::{Constraints, Environment, WorkflowStatus};

/// Poll cadence for the CLI's status loop.
const STATUS_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "armitage", about = "AI-directed security-testing orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one workflow to completion and print the report JSON.
    Run {
        /// Target URL or host.
        #[arg(long)]
        target: String,
        /// Natural-language testing intent.
        #[arg(long)]
        intent: String,
        /// Target environment: development, staging, or production.
        #[arg(long, default_value = "development")]
        environment: String,
        /// Wall-clock budget in seconds.
        #[arg(long)]
        time_limit_secs: Option<u64>,
        /// Minimum tests per phase for the exhaustive expansion.
        #[arg(long, default_value_t = 0)]
        min_tests_per_phase: usize,
        /// Tool names to exclude, repeatable.
        #[arg(long = "exclude")]
        exclude_tests: Vec<String>,
        /// Assert that authenticated testing is allowed.
        #[arg(long)]
        requires_auth: bool,
        /// Allow wordlist-based scans from the SecLists mount.
        #[arg(long)]
        use_wordlists: bool,
        /// Advance phases only when findings were produced.
        #[arg(long)]
        proceed_on_findings: bool,
    },
    /// List the tools available in the catalogue.
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = ArmitageConfig::load()?;

    match cli.command {
        Command::Tools => {
            armitage::logging::init_cli();
            let catalog =
                ToolCatalog::load(config.paths.catalog_file.as_deref().map(Path::new))?;
            for name in catalog.names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run {
            target,
            intent,
            environment,
            time_limit_secs,
            min_tests_per_phase,
            exclude_tests,
            requires_auth,
            use_wordlists,
            proceed_on_findings,
        } => {
            let _guard = armitage::logging::init_production(Path::new(&config.paths.logs_dir))?;
            let constraints = Constraints {
                environment: parse_environment(&environment)?,
                scope: vec![],
                time_limit: time_limit_secs.map(|s| s.saturating_mul(1000)),
                min_tests_per_phase,
                exclude_tests,
                requires_auth,
                use_seclists_wordlists: use_wordlists,
            };
            run_workflow(&config, &target, &intent, constraints, proceed_on_findings).await
        }
    }
}

/// Wire the components and drive one workflow to a terminal state.
async fn run_workflow(
    config: &ArmitageConfig,
    target: &str,
    intent: &str,
    constraints: Constraints,
    proceed_on_findings: bool,
) -> Result<()> {
    info!("armitage starting");

    let bus = EventBus::default();
    let catalog = Arc::new(ToolCatalog::load(
        config.paths.catalog_file.as_deref().map(Path::new),
    )?);
    let log = Arc::new(
        DecisionLog::new(&config.paths.audit_dir).context("failed to create decision log")?,
    );
    let _audit_task = spawn_audit_subscriber(&bus, Arc::clone(&log));

    let provider: Option<Arc<dyn LlmProvider>> = config.llm.anthropic.as_ref().map(|cloud| {
        Arc::new(AnthropicProvider::new(
            cloud.model.clone(),
            cloud.api_key.clone(),
        )) as Arc<dyn LlmProvider>
    });
    if provider.is_none() {
        info!("no LLM provider configured; using deterministic fallback strategies");
    }

    let planner = Arc::new(Planner::new(
        provider,
        Arc::clone(&catalog),
        config.paths.wordlist_mount_root.clone(),
        Arc::clone(&log),
        Duration::from_secs(config.llm.timeout_secs),
        config.llm.max_tokens,
    ));

    let approvals = ApprovalQueue::new(
        bus.clone(),
        config.approval.escalation_targets.clone(),
        Duration::from_secs(config.approval.default_timeout_secs),
    );

    let runtime = Arc::new(DockerRuntime::connect().context("cannot reach the Docker daemon")?);
    let wordlists = WordlistResolver::new(
        config.paths.wordlist_mount_root.clone(),
        config.paths.wordlist_host_root.clone(),
    );
    let engine = Arc::new(ExecutionEngine::new(
        runtime,
        Arc::clone(&catalog),
        RestraintEngine::with_defaults(),
        approvals.clone(),
        bus.clone(),
        Arc::clone(&log),
        &config.engine,
        config.sandbox.clone(),
        wordlists,
    ));

    let policy = if proceed_on_findings {
        ProceedPolicy::OnFindings
    } else {
        ProceedPolicy::Always
    };
    let orchestrator = Orchestrator::new(
        planner,
        engine,
        approvals,
        ProgressiveDiscovery::new(policy),
        bus,
        Duration::from_millis(config.engine.poll_interval_ms),
        &config.paths.audit_dir,
    );

    let id = orchestrator.submit(target, intent, constraints)?;
    println!("workflow {id} submitted");

    // Drive until terminal, relaying progress to the console log.
    loop {
        tokio::time::sleep(STATUS_POLL).await;
        let Some(snapshot) = orchestrator.status(id) else {
            anyhow::bail!("workflow {id} disappeared");
        };
        if snapshot.status.is_terminal() {
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot)
                    .context("failed to render final snapshot")?
            );
            if snapshot.status == WorkflowStatus::Failed {
                anyhow::bail!("workflow {id} failed");
            }
            return Ok(());
        }
    }
}

fn parse_environment(raw: &str) -> Result<Environment> {
    match raw.to_lowercase().as_str() {
        "development" | "dev" => Ok(Environment::Development),
        "staging" => Ok(Environment::Staging),
        "production" | "prod" => Ok(Environment::Production),
        other => anyhow::bail!("unknown environment '{other}'"),
    }
}
