//! Runtime configuration for the orchestration core.
//!
//! Read from a TOML file, then layered with environment overrides.
//!
//! # Configuration File Format
//!
//! ```toml
//! schema_version = "1.0.0"
//! default_provider_profile = "openai-default"
//! workspace_root = ".repoclinic/workspaces"
//! database_path = ".repoclinic/flow.db"
//!
//! [retries.branch]
//! max_attempts = 3
//! base_delay_ms = 1000
//! backoff_multiplier = 2.0
//! jitter_fraction = 0.2
//!
//! [timeouts]
//! scanner_seconds = 900
//! agent_seconds = 600
//! artifacts_seconds = 300
//!
//! [scan_policy]
//! max_files = 25000
//!
//! [branches]
//! max_failed = 1
//!
//! [lease]
//! ttl_seconds = 900
//!
//! [provider_profiles.openai-default]
//! provider_type = "openai"
//! model = "gpt-4.1-mini"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [provider_profiles.openai-default.capabilities]
//! context_window = 128000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::stage::ScanPolicy;

/// Version stamped on every run row and manifest.
pub const SCHEMA_VERSION: &str = "1.0.0";

pub const ENV_DB_PATH: &str = "REPOCLINIC_DB_PATH";
pub const ENV_WORKSPACE: &str = "REPOCLINIC_WORKSPACE";
pub const ENV_PROVIDER_PROFILE: &str = "REPOCLINIC_PROVIDER_PROFILE";

/// Model provider backing the branch and join adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    OpenAi,
    LmStudio,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::LmStudio => "lm_studio",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAi),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(ProviderType::LmStudio),
            _ => anyhow::bail!(
                "Unsupported provider type '{}'. Valid values: openai, lm_studio",
                s
            ),
        }
    }
}

impl Serialize for ProviderType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProviderType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What a provider profile's model can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub context_window: u32,
    #[serde(default = "default_true")]
    pub supports_structured_output: bool,
}

fn default_true() -> bool {
    true
}

/// A named model/provider configuration selectable per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider_type: ProviderType,
    pub model: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never enters the config or the manifest.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    pub capabilities: ProviderCapabilities,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_provider_timeout() -> u64 {
    600
}

impl ProviderProfile {
    /// Model identifier with the provider prefix LM Studio routing expects.
    pub fn normalized_model(&self) -> String {
        let model = self.model.trim();
        match self.provider_type {
            ProviderType::OpenAi => model.to_string(),
            ProviderType::LmStudio => {
                if model.starts_with("lm_studio/") {
                    model.to_string()
                } else if let Some(rest) = model.strip_prefix("lm-studio/") {
                    format!("lm_studio/{}", rest)
                } else {
                    format!("lm_studio/{}", model)
                }
            }
        }
    }

    fn validate(&self, name: &str, problems: &mut Vec<String>) {
        if self.model.trim().is_empty() {
            problems.push(format!("Provider profile '{}' has an empty model", name));
        }
        let missing = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        match self.provider_type {
            ProviderType::OpenAi => {
                if missing(&self.api_key_env) {
                    problems.push(format!(
                        "OpenAI profile '{}' must define api_key_env",
                        name
                    ));
                }
            }
            ProviderType::LmStudio => {
                if missing(&self.base_url) {
                    problems.push(format!(
                        "LM Studio profile '{}' must define base_url",
                        name
                    ));
                }
                if missing(&self.api_key_env) {
                    problems.push(format!(
                        "LM Studio profile '{}' must define api_key_env",
                        name
                    ));
                }
            }
        }
        if self.capabilities.context_window == 0 {
            problems.push(format!(
                "Provider profile '{}' must have a positive context_window",
                name
            ));
        }
        if self.max_tokens == 0 || self.max_tokens > self.capabilities.context_window {
            problems.push(format!(
                "Provider profile '{}': max_tokens ({}) must be within 1..={} (context_window)",
                name, self.max_tokens, self.capabilities.context_window
            ));
        }
        if self.timeout_seconds == 0 {
            problems.push(format!(
                "Provider profile '{}' must have a positive timeout_seconds",
                name
            ));
        }
    }
}

/// The stages a retry policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Scan,
    Branch,
    Join,
    Artifacts,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Scan,
        StageKind::Branch,
        StageKind::Join,
        StageKind::Artifacts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scan => "scan",
            StageKind::Branch => "branch",
            StageKind::Join => "join",
            StageKind::Artifacts => "artifacts",
        }
    }
}

/// Per-stage retry policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetriesSection {
    #[serde(default = "default_scan_retry")]
    pub scan: RetryPolicy,
    #[serde(default)]
    pub branch: RetryPolicy,
    #[serde(default)]
    pub join: RetryPolicy,
    #[serde(default = "default_artifacts_retry")]
    pub artifacts: RetryPolicy,
}

fn default_scan_retry() -> RetryPolicy {
    RetryPolicy::default().with_max_attempts(2)
}

fn default_artifacts_retry() -> RetryPolicy {
    RetryPolicy::default().with_max_attempts(2)
}

impl Default for RetriesSection {
    fn default() -> Self {
        Self {
            scan: default_scan_retry(),
            branch: RetryPolicy::default(),
            join: RetryPolicy::default(),
            artifacts: default_artifacts_retry(),
        }
    }
}

/// Per-attempt deadlines, used when a stage's retry policy sets none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_scanner_seconds")]
    pub scanner_seconds: u64,
    /// Branch and join adapters.
    #[serde(default = "default_agent_seconds")]
    pub agent_seconds: u64,
    #[serde(default = "default_artifacts_seconds")]
    pub artifacts_seconds: u64,
}

fn default_scanner_seconds() -> u64 {
    900
}

fn default_agent_seconds() -> u64 {
    600
}

fn default_artifacts_seconds() -> u64 {
    300
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            scanner_seconds: default_scanner_seconds(),
            agent_seconds: default_agent_seconds(),
            artifacts_seconds: default_artifacts_seconds(),
        }
    }
}

impl TimeoutsSection {
    pub fn for_stage(&self, stage: StageKind) -> Duration {
        let secs = match stage {
            StageKind::Scan => self.scanner_seconds,
            StageKind::Branch | StageKind::Join => self.agent_seconds,
            StageKind::Artifacts => self.artifacts_seconds,
        };
        Duration::from_secs(secs)
    }
}

/// Join policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchesSection {
    /// Failed branches tolerated before the run fails instead of joining.
    #[serde(default = "default_max_failed")]
    pub max_failed: usize,
}

fn default_max_failed() -> usize {
    1
}

impl Default for BranchesSection {
    fn default() -> Self {
        Self {
            max_failed: default_max_failed(),
        }
    }
}

/// Run lease settings.
///
/// A driving runner renews its lease every `ttl / 3` from a heartbeat task,
/// so the TTL bounds how long a crashed runner blocks a resume, not how long
/// a stage may run. A runner that misses renewals for a full TTL loses the
/// run and stops without writing to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_lease_ttl")]
    pub ttl_seconds: u64,
}

fn default_lease_ttl() -> u64 {
    900
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_lease_ttl(),
        }
    }
}

impl LeaseSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Interval between lease renewals while a run is being driven.
    pub fn heartbeat(&self) -> Duration {
        (self.ttl() / 3).max(Duration::from_millis(10))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_profile_name")]
    pub default_provider_profile: String,
    /// Parent directory for remote checkouts.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub retries: RetriesSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub scan_policy: ScanPolicy,
    #[serde(default)]
    pub branches: BranchesSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default = "default_provider_profiles")]
    pub provider_profiles: BTreeMap<String, ProviderProfile>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_profile_name() -> String {
    "openai-default".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".repoclinic/workspaces")
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".repoclinic/flow.db")
}

fn default_provider_profiles() -> BTreeMap<String, ProviderProfile> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        default_profile_name(),
        ProviderProfile {
            provider_type: ProviderType::OpenAi,
            model: "gpt-4.1-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            base_url: None,
            temperature: default_temperature(),
            seed: default_seed(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_provider_timeout(),
            capabilities: ProviderCapabilities {
                context_window: 128_000,
                supports_structured_output: true,
            },
        },
    );
    profiles
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            default_provider_profile: default_profile_name(),
            workspace_root: default_workspace_root(),
            database_path: default_database_path(),
            retries: RetriesSection::default(),
            timeouts: TimeoutsSection::default(),
            scan_policy: ScanPolicy::default(),
            branches: BranchesSection::default(),
            lease: LeaseSection::default(),
            provider_profiles: default_provider_profiles(),
        }
    }
}

impl FlowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse repoclinic config")
    }

    /// Load the file when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `REPOCLINIC_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests). Empty values are ignored.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = get(ENV_DB_PATH) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(root) = get(ENV_WORKSPACE) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(profile) = get(ENV_PROVIDER_PROFILE) {
            self.default_provider_profile = profile;
        }
        self
    }

    pub fn provider_profile(&self, name: &str) -> Option<&ProviderProfile> {
        self.provider_profiles.get(name)
    }

    /// Retry policy for a stage, with the stage's configured timeout filled
    /// in when the policy sets none.
    pub fn retry_policy_for(&self, stage: StageKind) -> RetryPolicy {
        let policy = match stage {
            StageKind::Scan => &self.retries.scan,
            StageKind::Branch => &self.retries.branch,
            StageKind::Join => &self.retries.join,
            StageKind::Artifacts => &self.retries.artifacts,
        };
        let mut policy = policy.clone();
        if policy.per_attempt_timeout.is_none() {
            policy.per_attempt_timeout = Some(self.timeouts.for_stage(stage));
        }
        policy
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.schema_version.trim().is_empty() {
            problems.push("schema_version must not be empty".to_string());
        }
        if !self
            .provider_profiles
            .contains_key(&self.default_provider_profile)
        {
            problems.push(format!(
                "default_provider_profile '{}' must exist in provider_profiles",
                self.default_provider_profile
            ));
        }
        for (name, profile) in &self.provider_profiles {
            profile.validate(name, &mut problems);
        }
        for stage in StageKind::ALL {
            for problem in self.retry_policy_for(stage).validate() {
                problems.push(format!("retries.{}: {}", stage.as_str(), problem));
            }
        }
        if self.timeouts.scanner_seconds == 0
            || self.timeouts.agent_seconds == 0
            || self.timeouts.artifacts_seconds == 0
        {
            problems.push("timeouts must be greater than zero".to_string());
        }
        if self.scan_policy.max_files == 0 || self.scan_policy.max_file_size_bytes == 0 {
            problems.push("scan_policy bounds must be greater than zero".to_string());
        }
        if self.branches.max_failed > 3 {
            problems.push(format!(
                "branches.max_failed ({}) exceeds the number of branches (3)",
                self.branches.max_failed
            ));
        }
        if self.lease.ttl_seconds == 0 {
            problems.push("lease.ttl_seconds must be greater than zero".to_string());
        }

        problems
    }

    /// `validate()` as a single error.
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }
        Ok(())
    }
}
