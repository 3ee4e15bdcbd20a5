//! Progressive discovery: the recon → analyze → exploit phase machine.
//!
//! The default policy is exhaustive: recon always proceeds to analyze,
//! and analyze proceeds to exploit unless the environment or the approval
//! record forbids it. Deployments that only want to advance on evidence
//! can flip the policy knob.

use serde::{Deserialize, Serialize};

use crate::types::{Constraints, Environment, Finding, Phase};

/// Tools considered destructive enough that excluding them all makes the
/// exploit phase pointless.
const EXPLOIT_TOOLS: [&str; 4] = [
    "injection-tester",
    "api-fuzzer",
    "jwt-analyzer",
    "ssrf-probe",
];

/// When a finished phase should hand over to the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProceedPolicy {
    /// Always advance (exhaustive testing).
    #[default]
    Always,
    /// Advance only when the finished phase produced findings.
    OnFindings,
}

/// What the discovery machine knows when deciding a transition.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Findings produced during the finished phase.
    pub phase_findings: &'a [Finding],
    /// Whether any gated step obtained a human approval this workflow.
    pub approval_obtained: bool,
    /// Whether any executed step was auth-requiring or critical priority.
    pub gated_steps_present: bool,
}

/// The three-state phase machine.
#[derive(Debug, Clone)]
pub struct ProgressiveDiscovery {
    policy: ProceedPolicy,
}

impl Default for ProgressiveDiscovery {
    fn default() -> Self {
        Self::new(ProceedPolicy::Always)
    }
}

impl ProgressiveDiscovery {
    /// Create a machine with the given proceed policy.
    pub fn new(policy: ProceedPolicy) -> Self {
        Self { policy }
    }

    /// The initial phase of every workflow.
    pub fn initial(&self) -> Phase {
        Phase::Recon
    }

    /// Decide whether the finished phase hands over to the next one.
    ///
    /// Returns the next phase, or `None` when the workflow is done.
    pub fn next_phase(
        &self,
        finished: Phase,
        constraints: &Constraints,
        ctx: &TransitionContext<'_>,
    ) -> Option<Phase> {
        let next = finished.next()?;

        if !self.proceed(ctx) {
            tracing::info!(phase = finished.as_str(), "phase did not meet proceed policy");
            return None;
        }

        if next == Phase::Exploit && !self.exploit_allowed(constraints, ctx) {
            return None;
        }

        Some(next)
    }

    /// Whether the proceed policy is satisfied for a finished phase.
    pub fn proceed(&self, ctx: &TransitionContext<'_>) -> bool {
        match self.policy {
            ProceedPolicy::Always => true,
            ProceedPolicy::OnFindings => !ctx.phase_findings.is_empty(),
        }
    }

    /// The exploit gate: never in production, only with an approval when
    /// gated steps ran, and only when the exploit tool set is not wholly
    /// excluded.
    fn exploit_allowed(&self, constraints: &Constraints, ctx: &TransitionContext<'_>) -> bool {
        if constraints.environment == Environment::Production {
            tracing::info!("exploit phase skipped: production environment");
            return false;
        }
        if ctx.gated_steps_present && !ctx.approval_obtained {
            tracing::info!("exploit phase skipped: gated steps ran without approval");
            return false;
        }
        let all_excluded = EXPLOIT_TOOLS
            .iter()
            .all(|tool| constraints.exclude_tests.iter().any(|t| t == tool));
        if all_excluded {
            tracing::info!("exploit phase skipped: destructive tools excluded");
            return false;
        }
        true
    }
}
