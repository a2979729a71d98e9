//! Run manifest: the reproducibility record written once per finished run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{FlowConfig, StageKind, TimeoutsSection};
use crate::flow::FlowState;
use crate::redaction::redact_text;
use crate::retry::RetryPolicy;
use crate::stage::{BranchKind, BranchStatus, SourceKind};
use crate::store::{BranchRecord, RunRecord, TransitionRecord};

/// Names reported by the adapters a runner was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterNames {
    pub scanner: String,
    pub architecture: String,
    pub security: String,
    pub performance: String,
    pub join: String,
    pub artifacts: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub repo_name: String,
    pub resolved_path: String,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Provider profile identity. Credentials are never recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub run_id: String,
    pub orchestrator_version: String,
    pub final_state: FlowState,
    pub repo: RepoInfo,
    pub provider: ProviderInfo,
    pub adapters: AdapterNames,
    /// Tool, model and prompt versions reported by the adapters.
    pub tool_versions: BTreeMap<String, String>,
    pub retries: BTreeMap<String, RetryPolicy>,
    pub timeouts: TimeoutsSection,
    pub max_failed_branches: usize,
    /// Adapter attempts per completed stage, keyed by node id.
    pub stage_attempts: BTreeMap<String, u32>,
    pub analysis_status: BTreeMap<String, BranchStatus>,
    /// Redacted failure/degradation reasons, keyed by branch.
    pub branch_failures: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Assemble the manifest from what the store holds for a finished run.
pub fn build_manifest(
    run: &RunRecord,
    transitions: &[TransitionRecord],
    branches: &[BranchRecord],
    config: &FlowConfig,
    adapters: &AdapterNames,
    tool_versions: &BTreeMap<String, String>,
) -> RunManifest {
    let profile = config.provider_profile(&run.provider_profile);

    let retries = StageKind::ALL
        .into_iter()
        .map(|stage| (stage.as_str().to_string(), config.retry_policy_for(stage)))
        .collect();

    let stage_attempts = transitions
        .iter()
        .filter_map(|t| t.attempts.map(|n| (t.node.as_str().to_string(), n)))
        .collect();

    let mut analysis_status = BTreeMap::new();
    let mut branch_failures = BTreeMap::new();
    for kind in BranchKind::ALL {
        if let Some(record) = branches.iter().find(|b| b.branch == kind) {
            analysis_status.insert(kind.as_str().to_string(), record.outcome.status());
            if let Some(reason) = record.outcome.reason() {
                branch_failures.insert(kind.as_str().to_string(), redact_text(reason));
            }
        }
    }

    let error = transitions
        .iter()
        .rev()
        .find(|t| t.to_state == FlowState::Failed)
        .map(|t| redact_text(&t.reason));

    RunManifest {
        schema_version: run.schema_version.clone(),
        run_id: run.run_id.clone(),
        orchestrator_version: env!("CARGO_PKG_VERSION").to_string(),
        final_state: run.status,
        repo: RepoInfo {
            repo_name: run.repo_name.clone(),
            resolved_path: run.resolved_path.clone(),
            source: run.target.source,
            url: run.target.url.clone(),
            branch: run.target.branch.clone(),
            commit: run.target.commit.clone(),
        },
        provider: ProviderInfo {
            profile: run.provider_profile.clone(),
            provider_type: profile.map(|p| p.provider_type.to_string()),
            model: profile.map(|p| p.normalized_model()),
        },
        adapters: adapters.clone(),
        tool_versions: tool_versions.clone(),
        retries,
        timeouts: config.timeouts.clone(),
        max_failed_branches: config.branches.max_failed,
        stage_attempts,
        analysis_status,
        branch_failures,
        error,
    }
}
