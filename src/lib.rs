//! Armitage, an AI-directed security-testing orchestrator.
//!
//! A user submits a target and an intent; the orchestrator plans a
//! sequence of containerized security tools through an LLM-backed
//! strategic planner, executes them in a sandboxed Docker runtime under
//! deterministic safety restraints, adapts the test tree as findings
//! arrive, and emits a structured report plus an append-only decision
//! audit trail.
#![allow(missing_docs)] // TODO: enforce once core types are stable

pub mod approval;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod events;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod providers;
pub mod restraint;
pub mod tree;
pub mod types;
