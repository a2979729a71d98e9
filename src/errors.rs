//! Typed error hierarchy for the orchestration core.
//!
//! Three enums cover the three layers:
//! - `FlowError`: what callers of the flow runner observe
//! - `StageError`: adapter-level classification that drives the retry loop
//! - `StoreError`: persistence failures and rejected writes

use crate::flow::FlowState;
use thiserror::Error;

/// Errors returned by `FlowRunner` operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Malformed request, unresolvable target or unknown provider profile.
    /// Raised before any run row exists; never retried.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Run {run_id} not found")]
    NotFound { run_id: String },

    #[error("Run {run_id} is held by another orchestrator")]
    RunBusy { run_id: String },

    /// This runner's lease expired or was taken over while it was driving
    /// the run. Nothing more was written; the new holder owns the run.
    #[error("Lease on run {run_id} was lost; run left to its current holder")]
    LeaseLost { run_id: String },

    /// Persistence failure while driving a run. The run has been moved to
    /// `FAILED` when the store still accepted that write.
    #[error("Infrastructure failure for run {run_id}: {source}")]
    Infrastructure {
        run_id: String,
        #[source]
        source: StoreError,
    },

    /// Internal invariant violated while driving a run.
    #[error("Invariant violated for run {run_id}: {message}")]
    Invariant { run_id: String, message: String },

    #[error("Run task for {run_id} did not complete: {message}")]
    TaskAborted { run_id: String, message: String },
}

impl FlowError {
    /// Run identifier the error refers to, when one was assigned.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            FlowError::Validation(_) => None,
            FlowError::NotFound { run_id }
            | FlowError::RunBusy { run_id }
            | FlowError::LeaseLost { run_id }
            | FlowError::Infrastructure { run_id, .. }
            | FlowError::Invariant { run_id, .. }
            | FlowError::TaskAborted { run_id, .. } => Some(run_id),
        }
    }

    pub(crate) fn infra(run_id: &str, source: StoreError) -> Self {
        match source {
            StoreError::LeaseLost { .. } => FlowError::LeaseLost {
                run_id: run_id.to_string(),
            },
            source => FlowError::Infrastructure {
                run_id: run_id.to_string(),
                source,
            },
        }
    }
}

/// Classified failure reported by a stage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Transient failure eligible for backoff and another attempt.
    #[error("retryable stage error: {0}")]
    Retryable(String),

    /// Failure that no amount of retrying will fix.
    #[error("terminal stage error: {0}")]
    Terminal(String),
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        StageError::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        StageError::Terminal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Retryable(msg) | StageError::Terminal(msg) => msg,
        }
    }
}

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {run_id} already exists")]
    RunExists { run_id: String },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Scanner snapshot already recorded for run {run_id}")]
    SnapshotExists { run_id: String },

    #[error("Run manifest already recorded for run {run_id}")]
    ManifestExists { run_id: String },

    #[error("Illegal transition {from} -> {to} for run {run_id}")]
    InvalidTransition {
        run_id: String,
        from: FlowState,
        to: FlowState,
    },

    #[error("Run {run_id} is {actual}, transition expects {expected}")]
    StatusMismatch {
        run_id: String,
        expected: FlowState,
        actual: FlowState,
    },

    #[error("Run {run_id} is leased by {owner} until {expires_at}")]
    LeaseHeld {
        run_id: String,
        owner: String,
        expires_at: String,
    },

    /// A fenced write was attempted by an owner that no longer holds a
    /// live lease on the run.
    #[error("Run {run_id} is not leased by {owner}")]
    LeaseLost { run_id: String, owner: String },

    /// A stored row could not be decoded; storage corruption is detected,
    /// never repaired.
    #[error("Corrupt {what} for run {run_id}: {message}")]
    Corrupt {
        run_id: String,
        what: &'static str,
        message: String,
    },

    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task panicked: {0}")]
    TaskPanicked(String),
}

/// `anyhow::Context`-style helper for rusqlite results.
pub(crate) trait DbContext<T> {
    fn db_context(self, context: &str) -> Result<T, StoreError>;
}

impl<T> DbContext<T> for Result<T, rusqlite::Error> {
    fn db_context(self, context: &str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Database {
            context: context.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_error_validation_has_no_run_id() {
        let err = FlowError::Validation("missing local path".into());
        assert!(err.run_id().is_none());
        assert!(err.to_string().contains("missing local path"));
    }

    #[test]
    fn flow_error_infrastructure_carries_run_id_and_source() {
        let err = FlowError::infra("run-7", StoreError::LockPoisoned);
        assert_eq!(err.run_id(), Some("run-7"));
        match &err {
            FlowError::Infrastructure { source, .. } => {
                assert!(matches!(source, StoreError::LockPoisoned));
            }
            _ => panic!("Expected Infrastructure"),
        }
        let source = std::error::Error::source(&err).expect("source should be set");
        assert_eq!(source.to_string(), "Database lock poisoned");
    }

    #[test]
    fn lost_lease_is_not_an_infrastructure_failure() {
        let err = FlowError::infra(
            "run-8",
            StoreError::LeaseLost {
                run_id: "run-8".into(),
                owner: "runner-a".into(),
            },
        );
        assert!(matches!(err, FlowError::LeaseLost { ref run_id } if run_id == "run-8"));
        assert_eq!(err.run_id(), Some("run-8"));
    }

    #[test]
    fn stage_error_classification() {
        assert!(StageError::retryable("rate limited").is_retryable());
        assert!(!StageError::terminal("bad input").is_retryable());
        assert_eq!(StageError::terminal("bad input").message(), "bad input");
    }

    #[test]
    fn store_error_invalid_transition_names_states() {
        let err = StoreError::InvalidTransition {
            run_id: "r1".into(),
            from: FlowState::Validated,
            to: FlowState::Done,
        };
        let msg = err.to_string();
        assert!(msg.contains("VALIDATED"));
        assert!(msg.contains("DONE"));
    }

    #[test]
    fn db_context_wraps_rusqlite_error() {
        let raw: Result<(), rusqlite::Error> = Err(rusqlite::Error::QueryReturnedNoRows);
        let err = raw.db_context("Failed to load run").unwrap_err();
        assert!(err.to_string().starts_with("Failed to load run"));
        assert!(matches!(err, StoreError::Database { .. }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&FlowError::Validation("x".into()));
        assert_std_error(&StageError::retryable("x"));
        assert_std_error(&StoreError::LockPoisoned);
    }
}
