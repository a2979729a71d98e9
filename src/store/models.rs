use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::{FlowNode, FlowState};
use crate::stage::{BranchKind, BranchOutcome, ResolvedTarget};

/// A persisted run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub schema_version: String,
    pub repo_name: String,
    pub resolved_path: String,
    pub provider_profile: String,
    /// Full resolution of the request, so a resumed run can re-dispatch the
    /// scan without the original request.
    pub target: ResolvedTarget,
    pub status: FlowState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields supplied when a run row is created. Status starts at `VALIDATED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub schema_version: String,
    pub provider_profile: String,
    pub target: ResolvedTarget,
}

impl NewRun {
    pub fn run_id(&self) -> &str {
        &self.target.run_id
    }
}

/// One immutable entry of a run's transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Store-assigned sequence; total order across the log.
    pub seq: i64,
    pub run_id: String,
    pub node: FlowNode,
    pub from_state: FlowState,
    pub to_state: FlowState,
    pub timestamp: DateTime<Utc>,
    /// Redacted before it was written.
    pub reason: String,
    /// Adapter attempts used by the stage this transition completes.
    pub attempts: Option<u32>,
}

/// A transition about to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransition {
    pub node: FlowNode,
    pub from: FlowState,
    pub to: FlowState,
    pub reason: String,
    pub attempts: Option<u32>,
    /// When set, the write is rejected unless this owner holds a live lease
    /// on the run at commit time.
    pub lease_owner: Option<String>,
}

impl NewTransition {
    pub fn new(node: FlowNode, from: FlowState, to: FlowState, reason: impl Into<String>) -> Self {
        Self {
            node,
            from,
            to,
            reason: reason.into(),
            attempts: None,
            lease_owner: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn fenced_by(mut self, owner: impl Into<String>) -> Self {
        self.lease_owner = Some(owner.into());
        self
    }
}

/// Persisted outcome of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub branch: BranchKind,
    pub outcome: BranchOutcome,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl BranchRecord {
    pub fn new(branch: BranchKind, outcome: BranchOutcome, attempts: u32) -> Self {
        Self {
            branch,
            outcome,
            attempts,
            recorded_at: Utc::now(),
        }
    }
}

/// Persisted run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

/// How `put_scanner_snapshot` treats an existing snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotWrite {
    /// Reject when the run already has a snapshot.
    #[default]
    Insert,
    /// Replace an existing snapshot; only for an explicitly sanctioned re-scan.
    Overwrite,
}

/// Exclusive claim on a run by one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub run_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}
