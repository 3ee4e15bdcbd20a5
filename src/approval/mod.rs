//! Human-in-the-loop approvals with timeout and escalation.
//!
//! When restraint evaluation returns require-approval, the execution
//! engine submits a request here and receives a `tokio::sync::oneshot`
//! receiver to await the decision. The tree executor keeps scheduling
//! other eligible nodes while one node waits; approvals are first-class
//! asynchronous values, never a whole-workflow block.
//!
//! Policies may auto-approve matching requests. Otherwise the request is
//! held pending, subscribed channels are notified, and a timer escalates
//! through the configured targets before finally timing out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBus, EventKind};
use crate::types::{Environment, Phase, Severity, WorkflowId};

/// What kind of action is being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalType {
    /// Running a specific test.
    TestExecution,
    /// Advancing to the next phase.
    PhaseTransition,
    /// Overriding a restraint denial.
    RestraintOverride,
    /// Accessing sensitive data.
    DataAccess,
    /// An exploitation step.
    Exploitation,
}

impl ApprovalType {
    /// Stable kebab-case label for events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestExecution => "test-execution",
            Self::PhaseTransition => "phase-transition",
            Self::RestraintOverride => "restraint-override",
            Self::DataAccess => "data-access",
            Self::Exploitation => "exploitation",
        }
    }
}

/// Lifecycle of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved by a human or policy.
    Approved,
    /// Denied.
    Denied,
    /// No decision arrived before the (final) deadline.
    Timeout,
    /// Escalated; re-enters pending at the next level.
    Escalated,
}

/// Context shown to the approver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalContext {
    /// Target under test.
    pub target: String,
    /// Tool or test name the request is about.
    pub test: String,
    /// Phase during which the request was raised.
    pub phase: Phase,
    /// Target environment.
    pub environment: Environment,
    /// How urgent the gated action is.
    pub severity: Severity,
    /// Why approval is needed.
    pub reason: String,
}

/// Supplementary metadata for the approver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalMetadata {
    /// Controls already applied (mitigations, rate limits).
    #[serde(default)]
    pub controls: Vec<String>,
    /// OWASP categories touched.
    #[serde(default)]
    pub owasp_categories: Vec<String>,
    /// Expected impact description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

/// A recorded human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Who decided.
    pub approver: String,
    /// When.
    pub timestamp: DateTime<Utc>,
    /// Optional rationale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Conditions attached to an approval.
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// Current escalation position of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationState {
    /// Escalation level, 1-based after the first escalation.
    pub level: u32,
    /// Target notified at this level.
    pub target: String,
    /// When the escalation happened.
    pub timestamp: DateTime<Utc>,
}

/// An approval request pending (or past) a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request id.
    pub id: Uuid,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// What kind of action is gated.
    pub request_type: ApprovalType,
    /// Context for the approver.
    pub context: ApprovalContext,
    /// Supplementary metadata.
    pub metadata: ApprovalMetadata,
    /// Per-request decision timeout.
    pub timeout: Duration,
    /// Current status.
    pub status: ApprovalStatus,
    /// Recorded decision, once any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    /// Escalation state, once escalated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationState>,
}

impl ApprovalRequest {
    /// Build a pending request with the given timeout.
    pub fn new(
        workflow_id: WorkflowId,
        request_type: ApprovalType,
        context: ApprovalContext,
        metadata: ApprovalMetadata,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            request_type,
            context,
            metadata,
            timeout,
            status: ApprovalStatus::Pending,
            decision: None,
            escalation: None,
        }
    }
}

/// What the waiting executor receives once the request resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The action may proceed.
    Approved {
        /// Who approved.
        approver: String,
        /// Conditions attached to the approval.
        conditions: Vec<String>,
    },
    /// The action must not proceed.
    Denied {
        /// Who denied.
        approver: String,
        /// Denial reason.
        reason: String,
    },
    /// No decision arrived in time.
    TimedOut,
}

/// Approval errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this id.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
}

/// A notification channel for new and escalated requests.
#[async_trait::async_trait]
pub trait ApprovalNotifier: Send + Sync {
    /// Deliver a request to the channel.
    async fn notify(&self, request: &ApprovalRequest);
}

/// Default notifier: structured log lines only.
pub struct TracingNotifier;

#[async_trait::async_trait]
impl ApprovalNotifier for TracingNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        info!(
            approval_id = %request.id,
            workflow = %request.workflow_id,
            request_type = request.request_type.as_str(),
            test = %request.context.test,
            reason = %request.context.reason,
            "approval requested"
        );
    }
}

/// A named approval policy with an auto-approve predicate.
struct Policy {
    name: &'static str,
    applies: fn(&ApprovalRequest) -> bool,
    auto_approve: fn(&ApprovalRequest) -> bool,
}

/// Default policy set.
fn default_policies() -> Vec<Policy> {
    vec![
        Policy {
            name: "production-safety",
            applies: |r| r.context.environment == Environment::Production,
            auto_approve: |_| false,
        },
        Policy {
            name: "exploitation-control",
            applies: |r| r.request_type == ApprovalType::Exploitation,
            auto_approve: |_| false,
        },
        Policy {
            name: "data-protection",
            applies: |r| r.request_type == ApprovalType::DataAccess,
            auto_approve: |r| r.context.severity == Severity::Info,
        },
        Policy {
            name: "auth-testing",
            applies: |r| r.request_type == ApprovalType::TestExecution,
            auto_approve: |r| {
                r.context.environment == Environment::Development
                    && r.context.severity <= Severity::Medium
            },
        },
    ]
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalOutcome>,
}

struct Inner {
    pending: HashMap<Uuid, PendingEntry>,
}

/// The approval queue shared by the engine and the external approval API.
#[derive(Clone)]
pub struct ApprovalQueue {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
    policies: Arc<Vec<Policy>>,
    notifiers: Arc<Vec<Arc<dyn ApprovalNotifier>>>,
    escalation_targets: Arc<Vec<String>>,
    default_timeout: Duration,
}

impl ApprovalQueue {
    /// Create a queue with the default policies and a tracing notifier.
    pub fn new(
        bus: EventBus,
        escalation_targets: Vec<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: HashMap::new(),
            })),
            bus,
            policies: Arc::new(default_policies()),
            notifiers: Arc::new(vec![Arc::new(TracingNotifier) as Arc<dyn ApprovalNotifier>]),
            escalation_targets: Arc::new(escalation_targets),
            default_timeout,
        }
    }

    /// Attach an additional notification channel.
    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        let mut notifiers: Vec<Arc<dyn ApprovalNotifier>> = self.notifiers.as_ref().clone();
        notifiers.push(notifier);
        self.notifiers = Arc::new(notifiers);
        self
    }

    /// Default timeout for requests that don't carry one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Submit a request and receive a future decision.
    ///
    /// If a matching policy auto-approves, the receiver resolves
    /// immediately with approver `"policy auto-approval"`. Otherwise the
    /// request is persisted as pending, channels are notified, and a
    /// timeout timer is armed.
    pub fn submit(&self, mut request: ApprovalRequest) -> oneshot::Receiver<ApprovalOutcome> {
        let (tx, rx) = oneshot::channel();

        if let Some(policy) = self.matching_auto_approval(&request) {
            info!(
                approval_id = %request.id,
                policy,
                test = %request.context.test,
                "policy auto-approval"
            );
            request.status = ApprovalStatus::Approved;
            self.bus.publish(
                request.workflow_id,
                EventKind::ApprovalProcessed {
                    approval_id: request.id.to_string(),
                    approved: true,
                },
            );
            let _ = tx.send(ApprovalOutcome::Approved {
                approver: "policy auto-approval".to_owned(),
                conditions: vec![],
            });
            return rx;
        }

        let id = request.id;
        let workflow_id = request.workflow_id;
        let timeout = request.timeout;

        self.bus.publish(
            workflow_id,
            EventKind::ApprovalRequested {
                approval_id: id.to_string(),
                request_type: request.request_type.as_str().to_owned(),
            },
        );

        for notifier in self.notifiers.iter() {
            let notifier = Arc::clone(notifier);
            let snapshot = request.clone();
            tokio::spawn(async move {
                notifier.notify(&snapshot).await;
            });
        }

        if let Ok(mut inner) = self.inner.lock() {
            inner.pending.insert(
                id,
                PendingEntry {
                    request,
                    sender: tx,
                },
            );
        }

        self.arm_timer(id, timeout);
        rx
    }

    /// Record an external decision for a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] when the request is unknown or
    /// already resolved.
    pub fn process(
        &self,
        id: Uuid,
        approved: bool,
        approver: &str,
        reason: Option<String>,
        conditions: Vec<String>,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let entry = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.pending.remove(&id).ok_or(ApprovalError::NotFound(id))?
        };

        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };

        info!(
            approval_id = %id,
            approver,
            approved,
            test = %entry.request.context.test,
            "approval resolved"
        );

        self.bus.publish(
            entry.request.workflow_id,
            EventKind::ApprovalProcessed {
                approval_id: id.to_string(),
                approved,
            },
        );

        let outcome = if approved {
            ApprovalOutcome::Approved {
                approver: approver.to_owned(),
                conditions,
            }
        } else {
            ApprovalOutcome::Denied {
                approver: approver.to_owned(),
                reason: reason.unwrap_or_else(|| "denied".to_owned()),
            }
        };
        // Receiver may be gone if the node was cancelled; that's fine.
        let _ = entry.sender.send(outcome);

        Ok(status)
    }

    /// Deny every pending request of a workflow (cancellation path).
    pub fn deny_workflow(&self, workflow_id: WorkflowId, reason: &str) {
        let drained: Vec<(Uuid, PendingEntry)> = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let ids: Vec<Uuid> = inner
                .pending
                .iter()
                .filter(|(_, e)| e.request.workflow_id == workflow_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in drained {
            warn!(approval_id = %id, %reason, "pending approval denied");
            self.bus.publish(
                workflow_id,
                EventKind::ApprovalProcessed {
                    approval_id: id.to_string(),
                    approved: false,
                },
            );
            let _ = entry.sender.send(ApprovalOutcome::Denied {
                approver: "system".to_owned(),
                reason: reason.to_owned(),
            });
        }
    }

    /// Requests currently awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.pending.len())
            .unwrap_or(0)
    }

    /// Snapshot of pending requests (for status display).
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.inner
            .lock()
            .map(|inner| inner.pending.values().map(|e| e.request.clone()).collect())
            .unwrap_or_default()
    }

    /// First policy that applies and auto-approves.
    fn matching_auto_approval(&self, request: &ApprovalRequest) -> Option<&'static str> {
        self.policies
            .iter()
            .find(|p| (p.applies)(request) && (p.auto_approve)(request))
            .map(|p| p.name)
    }

    /// Arm the timeout timer for a pending request.
    fn arm_timer(&self, id: Uuid, timeout: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            queue.on_timeout(id);
        });
    }

    /// Timeout path: escalate while targets remain, then time out.
    fn on_timeout(&self, id: Uuid) {
        let mut escalate_to: Option<(u32, String, WorkflowId, Duration)> = None;
        let mut timed_out: Option<PendingEntry> = None;

        {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(current_level) = inner
                .pending
                .get(&id)
                .map(|e| e.request.escalation.as_ref().map_or(0, |s| s.level))
            else {
                return; // Already resolved.
            };

            let next_level = current_level.saturating_add(1);
            let target_index = usize::try_from(current_level).unwrap_or(usize::MAX);

            match self.escalation_targets.get(target_index) {
                Some(target) => {
                    if let Some(entry) = inner.pending.get_mut(&id) {
                        entry.request.status = ApprovalStatus::Pending;
                        entry.request.escalation = Some(EscalationState {
                            level: next_level,
                            target: target.clone(),
                            timestamp: Utc::now(),
                        });
                        escalate_to = Some((
                            next_level,
                            target.clone(),
                            entry.request.workflow_id,
                            entry.request.timeout,
                        ));
                    }
                }
                None => {
                    timed_out = inner.pending.remove(&id);
                }
            }
        }

        if let Some((level, target, workflow_id, timeout)) = escalate_to {
            warn!(approval_id = %id, level, %target, "approval escalated");
            self.bus.publish(
                workflow_id,
                EventKind::ApprovalEscalated {
                    approval_id: id.to_string(),
                    level,
                },
            );
            if let Ok(inner) = self.inner.lock() {
                if let Some(entry) = inner.pending.get(&id) {
                    for notifier in self.notifiers.iter() {
                        let notifier = Arc::clone(notifier);
                        let snapshot = entry.request.clone();
                        tokio::spawn(async move {
                            notifier.notify(&snapshot).await;
                        });
                    }
                }
            }
            self.arm_timer(id, timeout);
        }

        if let Some(entry) = timed_out {
            warn!(approval_id = %id, test = %entry.request.context.test, "approval request timed out");
            self.bus.publish(
                entry.request.workflow_id,
                EventKind::ApprovalTimeout {
                    approval_id: id.to_string(),
                },
            );
            let _ = entry.sender.send(ApprovalOutcome::TimedOut);
        }
    }
}
