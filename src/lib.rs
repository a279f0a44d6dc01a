//! Emergency Payment Runbook
//!
//! Orchestrates the compliance checks for an urgent outbound payment:
//! - Parses a free-text payment request into a structured payment
//! - Screens the beneficiary, checks liquidity, looks up procedures
//! - Substitutes conservative results when an agent fails for good
//! - Combines everything into a deterministic decision packet
//! - Streams every step as an ordered, replayable event log
//!
//! PIPELINE:
//! INTAKE → SANCTIONS → LIQUIDITY → PROCEDURES → SUMMARIZE

pub mod agents;
pub mod api;
pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod execution;
pub mod intake;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod stream;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{RunOrchestrator, StartOutcome};
