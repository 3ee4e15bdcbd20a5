//! Decision audit trail for planner and engine activity.
//!
//! Writes structured JSON entries, one per line, to an append-only sink,
//! one file per workflow so a run's full decision history ships as a
//! single artifact. The audit component is a subscriber of the event bus,
//! never a caller of the core.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::events::{EventBus, EventKind};
use crate::types::WorkflowId;

/// Decision category discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// A planner strategy call.
    Planning,
    /// A planner adaptation call.
    Adaptation,
    /// A per-node decision hook ruling.
    NodeDecision,
    /// A container tool invocation.
    Execution,
    /// A restraint rule evaluation.
    Restraint,
    /// A human approval outcome.
    Approval,
}

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Routine entry.
    #[default]
    Info,
    /// Something was substituted or dropped; worth operator attention.
    Warning,
}

/// The decision half of an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutput {
    /// What was decided, e.g. "adopted", "fallback", "denied".
    pub decision: String,
    /// Reasoning text behind the decision.
    pub reasoning: String,
    /// Confidence attached to the decision, in [0, 1].
    pub confidence: f64,
}

/// Provenance metadata for an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionMetadata {
    /// Model identity for planner calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Call latency in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Tool involved, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Entry severity.
    #[serde(default)]
    pub level: AuditLevel,
}

/// A single structured decision log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Entry time.
    pub timestamp: DateTime<Utc>,
    /// Decision category.
    pub decision_type: DecisionType,
    /// Digest of the input that led to the decision.
    pub input: serde_json::Value,
    /// The decision itself.
    pub output: DecisionOutput,
    /// Provenance.
    pub metadata: DecisionMetadata,
}

impl DecisionEntry {
    /// Build an entry stamped with the current time.
    pub fn new(
        workflow_id: WorkflowId,
        decision_type: DecisionType,
        input: serde_json::Value,
        output: DecisionOutput,
        metadata: DecisionMetadata,
    ) -> Self {
        Self {
            workflow_id,
            timestamp: Utc::now(),
            decision_type,
            input,
            output,
            metadata,
        }
    }
}

/// Where entries are written.
enum Sink {
    /// One JSONL file per workflow under this directory.
    Directory(PathBuf),
    /// A single shared writer (tests).
    Writer(Mutex<Box<dyn Write + Send>>),
}

/// Append-only decision log.
pub struct DecisionLog {
    sink: Sink,
    /// Open per-workflow file handles; kept for the process lifetime.
    files: Mutex<HashMap<WorkflowId, std::fs::File>>,
}

impl DecisionLog {
    /// Create a log writing one file per workflow under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            sink: Sink::Directory(dir),
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Create a log from an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Sink::Writer(Mutex::new(writer)),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Append one entry as a JSON line, flushing immediately.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or write failure.
    pub fn append(&self, entry: &DecisionEntry) -> anyhow::Result<()> {
        let line = serde_json::to_string(entry)?;
        match &self.sink {
            Sink::Writer(writer) => {
                let mut writer = writer
                    .lock()
                    .map_err(|e| anyhow::anyhow!("decision log lock poisoned: {e}"))?;
                writeln!(writer, "{line}")?;
                writer.flush()?;
            }
            Sink::Directory(dir) => {
                let mut files = self
                    .files
                    .lock()
                    .map_err(|e| anyhow::anyhow!("decision log lock poisoned: {e}"))?;
                let file = match files.entry(entry.workflow_id) {
                    std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        let path = dir.join(format!("{}.jsonl", entry.workflow_id));
                        let file = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path)?;
                        slot.insert(file)
                    }
                };
                writeln!(file, "{line}")?;
                file.flush()?;
            }
        }
        Ok(())
    }

    /// Append, logging instead of propagating failures.
    ///
    /// Audit writes must never take down a running workflow.
    pub fn record(&self, entry: DecisionEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::error!(workflow = %entry.workflow_id, error = %e, "failed to write decision log entry");
        }
    }
}

/// Subscribe to the bus and persist decision-bearing events.
///
/// Runs until the bus is dropped. Planner and engine write richer entries
/// directly; this subscriber captures the event-level trail (approvals,
/// node decisions, execution outcomes) so the log is complete even for
/// components that only speak events.
pub fn spawn_audit_subscriber(bus: &EventBus, log: Arc<DecisionLog>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit subscriber lagged; events dropped");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let entry = match &event.kind {
                EventKind::NodeDecision { node_id, decision } => Some(DecisionEntry::new(
                    event.workflow_id,
                    DecisionType::NodeDecision,
                    serde_json::json!({ "node": node_id }),
                    DecisionOutput {
                        decision: decision.clone(),
                        reasoning: String::new(),
                        confidence: 1.0,
                    },
                    DecisionMetadata::default(),
                )),
                EventKind::ApprovalProcessed {
                    approval_id,
                    approved,
                } => Some(DecisionEntry::new(
                    event.workflow_id,
                    DecisionType::Approval,
                    serde_json::json!({ "approval": approval_id }),
                    DecisionOutput {
                        decision: if *approved { "approved" } else { "denied" }.to_owned(),
                        reasoning: String::new(),
                        confidence: 1.0,
                    },
                    DecisionMetadata::default(),
                )),
                EventKind::ApprovalTimeout { approval_id } => Some(DecisionEntry::new(
                    event.workflow_id,
                    DecisionType::Approval,
                    serde_json::json!({ "approval": approval_id }),
                    DecisionOutput {
                        decision: "timeout".to_owned(),
                        reasoning: "no decision before deadline".to_owned(),
                        confidence: 1.0,
                    },
                    DecisionMetadata {
                        level: AuditLevel::Warning,
                        ..DecisionMetadata::default()
                    },
                )),
                _ => None,
            };

            if let Some(entry) = entry {
                log.record(entry);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use uuid::Uuid;

    /// Shared buffer for capturing log output in tests.
    #[derive(Clone)]
    struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

    impl SharedBuf {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
        }

        fn contents(&self) -> String {
            let cursor = self.0.lock().expect("test lock");
            String::from_utf8_lossy(cursor.get_ref()).to_string()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("test lock").write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.lock().expect("test lock").flush()
        }
    }

    fn entry(workflow_id: WorkflowId) -> DecisionEntry {
        DecisionEntry::new(
            workflow_id,
            DecisionType::Planning,
            serde_json::json!({"phase": "recon"}),
            DecisionOutput {
                decision: "adopted".to_owned(),
                reasoning: "strategy validated".to_owned(),
                confidence: 0.8,
            },
            DecisionMetadata {
                model: Some("claude-test".to_owned()),
                latency_ms: Some(420),
                tool: None,
                level: AuditLevel::Info,
            },
        )
    }

    #[test]
    fn test_append_writes_json_lines() {
        let buf = SharedBuf::new();
        let log = DecisionLog::from_writer(Box::new(buf.clone()));
        let id = Uuid::new_v4();

        log.append(&entry(id)).expect("append 1");
        log.append(&entry(id)).expect("append 2");

        let output = buf.contents();
        let lines: Vec<&str> = output.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: serde_json::Value =
                serde_json::from_str(line).expect("each line is valid JSON");
            assert_eq!(parsed["decision_type"], "planning");
            assert_eq!(parsed["output"]["decision"], "adopted");
            assert_eq!(parsed["metadata"]["model"], "claude-test");
        }
    }

    #[test]
    fn test_directory_sink_writes_file_per_workflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = DecisionLog::new(dir.path()).expect("create log");

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        log.append(&entry(first)).expect("append first");
        log.append(&entry(second)).expect("append second");
        log.append(&entry(first)).expect("append first again");

        let first_contents =
            std::fs::read_to_string(dir.path().join(format!("{first}.jsonl"))).expect("read");
        let second_contents =
            std::fs::read_to_string(dir.path().join(format!("{second}.jsonl"))).expect("read");
        assert_eq!(first_contents.trim().lines().count(), 2);
        assert_eq!(second_contents.trim().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_persists_approval_events() {
        let buf = SharedBuf::new();
        let log = Arc::new(DecisionLog::from_writer(Box::new(buf.clone())));
        let bus = EventBus::default();
        let handle = spawn_audit_subscriber(&bus, Arc::clone(&log));

        let id = Uuid::new_v4();
        bus.publish(
            id,
            EventKind::ApprovalProcessed {
                approval_id: "a1".to_owned(),
                approved: false,
            },
        );

        // Give the subscriber a tick to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let output = buf.contents();
        let line = output.trim().lines().next().expect("one entry");
        let parsed: serde_json::Value = serde_json::from_str(line).expect("valid JSON");
        assert_eq!(parsed["decision_type"], "approval");
        assert_eq!(parsed["output"]["decision"], "denied");
    }

    #[test]
    fn test_record_swallows_write_errors() {
        /// Writer that always fails.
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let log = DecisionLog::from_writer(Box::new(Broken));
        // Must not panic.
        log.record(entry(Uuid::new_v4()));
    }
}
