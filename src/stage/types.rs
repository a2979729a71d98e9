use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Opaque payload produced by a branch adapter.
pub type BranchPayload = Value;

/// Opaque payload produced by the join adapter.
pub type SynthesisPayload = Value;

/// The three independent analysis branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Architecture,
    Security,
    Performance,
}

impl BranchKind {
    pub const ALL: [BranchKind; 3] = [
        BranchKind::Architecture,
        BranchKind::Security,
        BranchKind::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Security => "security",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architecture" => Ok(Self::Architecture),
            "security" => Ok(Self::Security),
            "performance" => Ok(Self::Performance),
            _ => Err(format!("Invalid branch: {}", s)),
        }
    }
}

/// Include/exclude and size bounds the scan adapter must honor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPolicy {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_exclude_globs() -> Vec<String> {
    [
        ".git/**",
        "node_modules/**",
        "dist/**",
        "build/**",
        ".venv/**",
        "__pycache__/**",
        "vendor/**",
        "tests/fixtures/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_size_bytes() -> u64 {
    1_000_000
}

fn default_max_files() -> usize {
    25_000
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
            max_file_size_bytes: default_max_file_size_bytes(),
            max_files: default_max_files(),
        }
    }
}

/// Where the analyzed repository came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalPath,
    GitHub,
}

/// A validated analysis target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub run_id: String,
    pub repo_name: String,
    pub resolved_path: PathBuf,
    pub source: SourceKind,
    /// Remote URL when the source is not a local directory; cloning into
    /// `resolved_path` is the scan adapter's job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Output of the scan stage. One per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScannerSnapshot {
    pub payload: Value,
}

impl ScannerSnapshot {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// Per-branch settings handed to a branch adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub run_id: String,
    pub kind: BranchKind,
    pub provider_profile: String,
}

/// Terminal status of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Succeeded,
    Degraded,
    Failed,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid branch status: {}", s)),
        }
    }
}

/// Validated result of one branch.
///
/// `Degraded` is a terminal, non-aborting state: the branch gave up but left
/// a placeholder payload so synthesis can proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchOutcome {
    Succeeded { payload: BranchPayload },
    Degraded { payload: BranchPayload, reason: String },
    Failed { reason: String },
}

impl BranchOutcome {
    pub fn status(&self) -> BranchStatus {
        match self {
            Self::Succeeded { .. } => BranchStatus::Succeeded,
            Self::Degraded { .. } => BranchStatus::Degraded,
            Self::Failed { .. } => BranchStatus::Failed,
        }
    }

    pub fn payload(&self) -> Option<&BranchPayload> {
        match self {
            Self::Succeeded { payload } | Self::Degraded { payload, .. } => Some(payload),
            Self::Failed { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Degraded { reason, .. } | Self::Failed { reason } => Some(reason),
        }
    }
}

/// Exactly one outcome per branch: the join stage's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOutcomes {
    pub architecture: BranchOutcome,
    pub security: BranchOutcome,
    pub performance: BranchOutcome,
}

impl BranchOutcomes {
    /// Assemble the set; `None` unless every branch has an outcome.
    pub fn from_parts<I>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = (BranchKind, BranchOutcome)>,
    {
        let mut architecture = None;
        let mut security = None;
        let mut performance = None;
        for (kind, outcome) in parts {
            match kind {
                BranchKind::Architecture => architecture = Some(outcome),
                BranchKind::Security => security = Some(outcome),
                BranchKind::Performance => performance = Some(outcome),
            }
        }
        Some(Self {
            architecture: architecture?,
            security: security?,
            performance: performance?,
        })
    }

    pub fn get(&self, kind: BranchKind) -> &BranchOutcome {
        match kind {
            BranchKind::Architecture => &self.architecture,
            BranchKind::Security => &self.security,
            BranchKind::Performance => &self.performance,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (BranchKind, &BranchOutcome)> {
        BranchKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }

    pub fn count(&self, status: BranchStatus) -> usize {
        self.iter().filter(|(_, o)| o.status() == status).count()
    }
}

/// Everything the materializer needs, read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInput {
    pub run_id: String,
    pub repo_name: String,
    pub resolved_path: PathBuf,
    pub snapshot: ScannerSnapshot,
    pub outcomes: BranchOutcomes,
    pub synthesis: SynthesisPayload,
}

/// Files written by the materializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub files: Vec<PathBuf>,
}
