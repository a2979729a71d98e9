//! Durable state for runs: the single source of truth the flow runner
//! rebuilds from on every resume.

mod db;
mod models;

pub use db::{DbHandle, FlowDb};
pub use models::{
    BranchRecord, ManifestRecord, NewRun, NewTransition, RunLease, RunRecord, SnapshotWrite,
    TransitionRecord,
};
