//! Orchestration core of a scanner-first repository analysis pipeline.
//!
//! A run scans a repository once, fans out into architecture, security and
//! performance branches, fans back in to a synthesis stage and hands the
//! result to an artifact materializer. Every state change is persisted
//! before the next stage starts, so an interrupted run resumes where it
//! stopped.

pub mod config;
pub mod errors;
pub mod flow;
pub mod redaction;
pub mod retry;
pub mod stage;
pub mod store;
pub mod telemetry;

pub use config::FlowConfig;
pub use errors::{FlowError, StageError, StoreError};
pub use flow::{AnalyzeRequest, FlowRunner, FlowState, RunHandle, RunResult, StartMode};
