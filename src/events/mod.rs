//! In-process event bus: the only observability boundary of the core.
//!
//! Every state change is published here as a JSON-serialisable record;
//! persistence (audit, status views) subscribes rather than being called
//! directly. Fan-out uses a `tokio::sync::broadcast` channel so slow or
//! absent subscribers never block publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Phase, WorkflowId, WorkflowStatus};

/// Default broadcast capacity; laggy subscribers drop oldest events.
const DEFAULT_CAPACITY: usize = 1024;

/// The event vocabulary published by the core components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    /// A workflow was accepted and is starting.
    #[serde(rename = "workflow:start")]
    WorkflowStart {
        /// Target under test.
        target: String,
        /// User intent text.
        intent: String,
    },
    /// The intent classifier labelled the workflow.
    #[serde(rename = "workflow:classified")]
    WorkflowClassified {
        /// Assigned category.
        category: String,
    },
    /// Target enrichment finished.
    #[serde(rename = "workflow:enriched")]
    WorkflowEnriched {
        /// Enrichment summary payload.
        summary: serde_json::Value,
    },
    /// A phase began.
    #[serde(rename = "workflow:phase:start")]
    PhaseStart {
        /// Phase that started.
        phase: Phase,
    },
    /// A phase finished.
    #[serde(rename = "workflow:phase:complete")]
    PhaseComplete {
        /// Phase that finished.
        phase: Phase,
        /// Findings produced during the phase.
        findings: usize,
        /// Whether the discovery machine advances.
        proceed: bool,
    },
    /// Workflow reached a terminal state.
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted {
        /// Whether the deadline truncated the run.
        truncated: bool,
    },
    /// Workflow failed fatally.
    #[serde(rename = "workflow:failed")]
    WorkflowFailed {
        /// Error description.
        error: String,
    },
    /// Workflow was cancelled.
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled,

    /// The decision hook ruled on a node.
    #[serde(rename = "node:decision")]
    NodeDecision {
        /// Node id.
        node_id: String,
        /// Decision taken: execute, skip, or add-children.
        decision: String,
    },
    /// A node was dispatched.
    #[serde(rename = "node:start")]
    NodeStart {
        /// Node id.
        node_id: String,
        /// Tool name.
        tool: String,
    },
    /// A node completed.
    #[serde(rename = "node:complete")]
    NodeComplete {
        /// Node id.
        node_id: String,
        /// Findings parsed from the node's output.
        findings: usize,
    },
    /// A node failed terminally.
    #[serde(rename = "node:failed")]
    NodeFailed {
        /// Node id.
        node_id: String,
        /// Error text.
        error: String,
    },

    /// A container execution started.
    #[serde(rename = "execution:start")]
    ExecutionStart {
        /// Engine request id.
        request_id: String,
        /// Tool name.
        tool: String,
    },
    /// A container execution finished successfully.
    #[serde(rename = "execution:complete")]
    ExecutionComplete {
        /// Engine request id.
        request_id: String,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
    },
    /// A container execution failed.
    #[serde(rename = "execution:failed")]
    ExecutionFailed {
        /// Engine request id.
        request_id: String,
        /// Error text.
        error: String,
    },

    /// An approval request was posted.
    #[serde(rename = "approval:requested")]
    ApprovalRequested {
        /// Approval request id.
        approval_id: String,
        /// Request type label.
        request_type: String,
    },
    /// An approval decision was processed.
    #[serde(rename = "approval:processed")]
    ApprovalProcessed {
        /// Approval request id.
        approval_id: String,
        /// Whether the request was approved.
        approved: bool,
    },
    /// An approval timed out.
    #[serde(rename = "approval:timeout")]
    ApprovalTimeout {
        /// Approval request id.
        approval_id: String,
    },
    /// An approval escalated to the next level.
    #[serde(rename = "approval:escalated")]
    ApprovalEscalated {
        /// Approval request id.
        approval_id: String,
        /// New escalation level.
        level: u32,
    },

    /// The test tree was built for a phase.
    #[serde(rename = "tree:built")]
    TreeBuilt {
        /// Number of nodes in the tree.
        nodes: usize,
    },
    /// The test tree grew from an adaptation.
    #[serde(rename = "tree:adapted")]
    TreeAdapted {
        /// Node the adaptation was rooted under.
        origin_node: String,
        /// Children appended.
        added: usize,
    },

    /// Workflow status changed (status snapshots for subscribers).
    #[serde(rename = "workflow:status")]
    StatusChanged {
        /// New status.
        status: WorkflowStatus,
    },
}

/// A published event with its envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Workflow the event belongs to.
    pub workflow_id: WorkflowId,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Event kind and payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast event bus shared by all core components.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given buffered capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; having no subscribers is fine.
    pub fn publish(&self, workflow_id: WorkflowId, kind: EventKind) {
        let event = WorkflowEvent {
            workflow_id,
            timestamp: Utc::now(),
            kind,
        };
        tracing::debug!(workflow = %workflow_id, event = ?event.kind, "event published");
        // Err means no live subscribers, which is not an error for a bus.
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers (for tests and status).
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(
            id,
            EventKind::NodeStart {
                node_id: "n1".to_owned(),
                tool: "port-scanner".to_owned(),
            },
        );

        let event = rx.recv().await.expect("event should arrive");
        assert_eq!(event.workflow_id, id);
        assert!(matches!(event.kind, EventKind::NodeStart { .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        // Must not panic or error.
        bus.publish(Uuid::new_v4(), EventKind::WorkflowCancelled);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WorkflowEvent {
            workflow_id: Uuid::nil(),
            timestamp: Utc::now(),
            kind: EventKind::PhaseStart {
                phase: crate::types::Phase::Recon,
            },
        };

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "workflow:phase:start");
        assert_eq!(json["payload"]["phase"], "recon");
        assert!(json["workflow_id"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_execution_events_carry_request_id() {
        let kind = EventKind::ExecutionComplete {
            request_id: "req-1".to_owned(),
            duration_ms: 1200,
        };
        let json = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(json["type"], "execution:complete");
        assert_eq!(json["payload"]["request_id"], "req-1");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(id, EventKind::WorkflowCancelled);

        assert!(matches!(
            rx1.recv().await.expect("rx1").kind,
            EventKind::WorkflowCancelled
        ));
        assert!(matches!(
            rx2.recv().await.expect("rx2").kind,
            EventKind::WorkflowCancelled
        ));
    }
}
