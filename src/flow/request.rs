//! Analysis requests and their resolution into a [`ResolvedTarget`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::FlowConfig;
use crate::errors::FlowError;
use crate::stage::{ResolvedTarget, SourceKind};

static GITHUB_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com[:/](?P<owner>[^/\s]+)/(?P<repo>[^/.\s]+)").unwrap()
});

static RUN_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// Where the repository to analyze lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum SourceInput {
    LocalPath {
        path: PathBuf,
    },
    #[serde(rename = "github_url")]
    GitHub {
        url: String,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        commit: Option<String>,
    },
}

/// A request to analyze one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    /// Caller-chosen run id; a v4 UUID is generated when absent.
    #[serde(default)]
    pub run_id: Option<String>,
    pub source: SourceInput,
    /// Profile name; the config's default profile when absent.
    #[serde(default)]
    pub provider_profile: Option<String>,
}

impl AnalyzeRequest {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: None,
            source: SourceInput::LocalPath { path: path.into() },
            provider_profile: None,
        }
    }

    pub fn github(url: impl Into<String>) -> Self {
        Self {
            run_id: None,
            source: SourceInput::GitHub {
                url: url.into(),
                branch: None,
                commit: None,
            },
            provider_profile: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_provider_profile(mut self, profile: impl Into<String>) -> Self {
        self.provider_profile = Some(profile.into());
        self
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub target: ResolvedTarget,
    pub provider_profile: String,
}

/// Check a request against the config and resolve its target.
///
/// Everything here runs before a run row exists; failures are
/// `FlowError::Validation`.
pub fn validate_request(
    request: &AnalyzeRequest,
    config: &FlowConfig,
) -> Result<ValidatedRequest, FlowError> {
    let run_id = match &request.run_id {
        Some(id) if !RUN_ID.is_match(id) => {
            return Err(FlowError::Validation(format!(
                "run id '{}' must be 1-128 characters of [A-Za-z0-9._-]",
                id
            )));
        }
        Some(id) => id.clone(),
        None => uuid::Uuid::new_v4().to_string(),
    };

    let provider_profile = request
        .provider_profile
        .clone()
        .unwrap_or_else(|| config.default_provider_profile.clone());
    if config.provider_profile(&provider_profile).is_none() {
        return Err(FlowError::Validation(format!(
            "unknown provider profile '{}'",
            provider_profile
        )));
    }

    let target = resolve_source(&request.source, &run_id, &config.workspace_root)?;
    Ok(ValidatedRequest {
        target,
        provider_profile,
    })
}

fn resolve_source(
    source: &SourceInput,
    run_id: &str,
    workspace_root: &Path,
) -> Result<ResolvedTarget, FlowError> {
    match source {
        SourceInput::LocalPath { path } => {
            if path.as_os_str().is_empty() {
                return Err(FlowError::Validation("local path is empty".into()));
            }
            let resolved = std::fs::canonicalize(path).map_err(|e| {
                FlowError::Validation(format!("invalid local path {}: {}", path.display(), e))
            })?;
            if !resolved.is_dir() {
                return Err(FlowError::Validation(format!(
                    "invalid local path {}: not a directory",
                    resolved.display()
                )));
            }
            let repo_name = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    FlowError::Validation(format!(
                        "cannot derive a repository name from {}",
                        resolved.display()
                    ))
                })?;
            Ok(ResolvedTarget {
                run_id: run_id.to_string(),
                repo_name,
                resolved_path: resolved,
                source: SourceKind::LocalPath,
                url: None,
                branch: None,
                commit: None,
            })
        }
        SourceInput::GitHub {
            url,
            branch,
            commit,
        } => {
            let repo_name = github_repo_name(url).ok_or_else(|| {
                FlowError::Validation(format!("unsupported GitHub URL: {}", url))
            })?;
            Ok(ResolvedTarget {
                run_id: run_id.to_string(),
                resolved_path: workspace_root.join(format!("{}-{}", repo_name, run_id)),
                repo_name,
                source: SourceKind::GitHub,
                url: Some(url.clone()),
                branch: branch.clone(),
                commit: commit.clone(),
            })
        }
    }
}

/// Repository name from a `github.com[:/]owner/repo` URL.
pub fn github_repo_name(url: &str) -> Option<String> {
    GITHUB_REPO
        .captures(url)
        .and_then(|caps| caps.name("repo"))
        .map(|m| m.as_str().to_string())
}
