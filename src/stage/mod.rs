//! Contracts for the externally owned pipeline stages.
//!
//! The flow runner only sees these traits and the validated types they
//! exchange. Whether an adapter shells out to scanners, applies heuristic
//! rules or calls a model is invisible here; any normalization of loose
//! adapter output happens inside the adapter before it returns.

mod types;

pub use types::{
    ArtifactInput, ArtifactPaths, BranchConfig, BranchKind, BranchOutcome, BranchOutcomes,
    BranchPayload, BranchStatus, ResolvedTarget, ScanPolicy, ScannerSnapshot, SourceKind,
    SynthesisPayload,
};

use std::collections::BTreeMap;

use crate::errors::StageError;
use async_trait::async_trait;
use serde_json::json;

/// Deterministic inventory/scan stage.
#[async_trait]
pub trait ScanAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Versions of the tools, models or prompts behind this adapter, recorded
    /// in the run manifest.
    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Must be deterministic for identical inputs and respect the policy's
    /// traversal bounds and exclusion globs.
    async fn scan(
        &self,
        target: &ResolvedTarget,
        policy: &ScanPolicy,
    ) -> Result<ScannerSnapshot, StageError>;
}

/// One analysis branch (architecture, security or performance).
#[async_trait]
pub trait BranchAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn analyze(
        &self,
        snapshot: &ScannerSnapshot,
        config: &BranchConfig,
    ) -> Result<BranchPayload, StageError>;

    /// Placeholder payload stored when the branch degrades.
    fn placeholder(&self, kind: BranchKind, reason: &str) -> BranchPayload {
        json!({
            "branch": kind.as_str(),
            "status": "degraded",
            "findings": [],
            "reason": reason,
        })
    }
}

/// Fan-in synthesis over all three branch outcomes.
#[async_trait]
pub trait JoinAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Receives exactly three outcomes in any mix of succeeded/degraded
    /// (and capped failed). Returns an error when it cannot synthesize.
    async fn synthesize(&self, outcomes: &BranchOutcomes) -> Result<SynthesisPayload, StageError>;
}

/// Writes the run's artifacts once synthesis is durable.
#[async_trait]
pub trait ArtifactMaterializer: Send + Sync {
    fn name(&self) -> &str;

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn materialize(&self, input: &ArtifactInput) -> Result<ArtifactPaths, StageError>;
}
