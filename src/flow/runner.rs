//! The flow runner: drives a run through scan, branches, join and artifacts.
//!
//! The store is the only source of truth. Each pass of the drive loop reads
//! the run's status back from the store and executes the stage that status
//! names, so starting a run and resuming one after a crash are the same
//! code path. A stage's output and its completion transition are committed
//! in one store transaction; a stage is complete iff that transition is in
//! the log.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{FlowConfig, StageKind};
use crate::errors::{FlowError, StageError, StoreError};
use crate::flow::manifest::{AdapterNames, build_manifest};
use crate::flow::observer::{NoopObserver, TransitionObserver, notify};
use crate::flow::request::{AnalyzeRequest, validate_request};
use crate::flow::{FlowNode, FlowState};
use crate::redaction::redact_value;
use crate::retry::{JitterSource, RetryExecutor, RetryFailure, UniformJitter};
use crate::stage::{
    ArtifactInput, ArtifactMaterializer, ArtifactPaths, BranchAdapter, BranchConfig, BranchKind,
    BranchOutcome, BranchOutcomes, BranchStatus, JoinAdapter, ScanAdapter, ScannerSnapshot,
};
use crate::store::{
    BranchRecord, DbHandle, ManifestRecord, NewRun, NewTransition, RunRecord, TransitionRecord,
};

/// The stage implementations a runner drives.
#[derive(Clone)]
pub struct Adapters {
    pub scanner: Arc<dyn ScanAdapter>,
    pub architecture: Arc<dyn BranchAdapter>,
    pub security: Arc<dyn BranchAdapter>,
    pub performance: Arc<dyn BranchAdapter>,
    pub join: Arc<dyn JoinAdapter>,
    pub artifacts: Arc<dyn ArtifactMaterializer>,
}

impl Adapters {
    pub fn branch(&self, kind: BranchKind) -> &Arc<dyn BranchAdapter> {
        match kind {
            BranchKind::Architecture => &self.architecture,
            BranchKind::Security => &self.security,
            BranchKind::Performance => &self.performance,
        }
    }

    pub fn names(&self) -> AdapterNames {
        AdapterNames {
            scanner: self.scanner.name().to_string(),
            architecture: self.architecture.name().to_string(),
            security: self.security.name().to_string(),
            performance: self.performance.name().to_string(),
            join: self.join.name().to_string(),
            artifacts: self.artifacts.name().to_string(),
        }
    }

    /// Versions reported by every adapter, merged into one map.
    pub fn tool_versions(&self) -> BTreeMap<String, String> {
        let mut versions = self.scanner.versions();
        for kind in BranchKind::ALL {
            versions.extend(self.branch(kind).versions());
        }
        versions.extend(self.join.versions());
        versions.extend(self.artifacts.versions());
        versions
    }
}

/// Whether `start` waits for the run to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    #[default]
    Blocking,
    /// Spawn the run on the tokio runtime and return immediately.
    Detached,
}

/// Handle to a started or resumed run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Finished(FlowState),
    Running(JoinHandle<Result<FlowState, FlowError>>),
}

impl RunHandle {
    fn finished(run_id: String, state: FlowState) -> Self {
        Self {
            run_id,
            state: HandleState::Finished(state),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Terminal state, if the run has already finished.
    pub fn terminal_state(&self) -> Option<FlowState> {
        match &self.state {
            HandleState::Finished(state) => Some(*state),
            HandleState::Running(_) => None,
        }
    }

    /// Abort a detached run as if its process had died.
    ///
    /// The lease is not released; another runner can resume the run once
    /// the lease expires.
    pub async fn abort(self) {
        if let HandleState::Running(handle) = self.state {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<FlowState, FlowError> {
        match self.state {
            HandleState::Finished(state) => Ok(state),
            HandleState::Running(handle) => handle.await.map_err(|e| FlowError::TaskAborted {
                run_id: self.run_id.clone(),
                message: e.to_string(),
            })?,
        }
    }
}

/// Everything persisted about a run, as returned by [`FlowRunner::result`].
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: FlowState,
    pub manifest: Option<ManifestRecord>,
    /// Reason recorded on the transition into `FAILED`.
    pub error: Option<String>,
    pub branch_outcomes: Vec<BranchRecord>,
    pub artifacts: Option<ArtifactPaths>,
}

/// Drives runs against a store and a set of adapters.
///
/// Cheap to clone; clones share the store handle and the set of runs this
/// process is driving.
#[derive(Clone)]
pub struct FlowRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    db: DbHandle,
    config: FlowConfig,
    adapters: Adapters,
    adapter_names: AdapterNames,
    tool_versions: BTreeMap<String, String>,
    observer: Arc<dyn TransitionObserver>,
    jitter: Arc<dyn JitterSource>,
    /// Lease owner token; unique per runner.
    owner: String,
    active: Mutex<HashSet<String>>,
}

impl FlowRunner {
    /// Build a runner. Fails with `Validation` when the config is invalid.
    pub fn new(config: FlowConfig, db: DbHandle, adapters: Adapters) -> Result<Self, FlowError> {
        config
            .ensure_valid()
            .map_err(|e| FlowError::Validation(format!("{:#}", e)))?;
        let adapter_names = adapters.names();
        let tool_versions = adapters.tool_versions();
        Ok(Self {
            inner: Arc::new(RunnerInner {
                db,
                config,
                adapters,
                adapter_names,
                tool_versions,
                observer: Arc::new(NoopObserver),
                jitter: Arc::new(UniformJitter),
                owner: format!("runner-{}", uuid::Uuid::new_v4()),
                active: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Replace the transition observer. Call before sharing the runner.
    pub fn with_observer(self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.map_inner(|inner| inner.observer = observer)
    }

    /// Replace the retry jitter source (deterministic delays in tests).
    pub fn with_jitter(self, jitter: Arc<dyn JitterSource>) -> Self {
        self.map_inner(|inner| inner.jitter = jitter)
    }

    fn map_inner(self, f: impl FnOnce(&mut RunnerInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                tracing::warn!("runner already shared; builder call ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    /// Validate the request, create the run and execute it.
    pub async fn start(
        &self,
        request: AnalyzeRequest,
        mode: StartMode,
    ) -> Result<RunHandle, FlowError> {
        let inner = &self.inner;
        let validated = validate_request(&request, &inner.config)?;
        let run_id = validated.target.run_id.clone();
        let new_run = NewRun {
            schema_version: inner.config.schema_version.clone(),
            provider_profile: validated.provider_profile,
            target: validated.target,
        };

        match inner.db.call(move |db| db.create_run(&new_run)).await {
            Ok(run) => {
                tracing::info!(
                    run_id = %run.run_id,
                    repo = %run.repo_name,
                    profile = %run.provider_profile,
                    "run created"
                );
            }
            Err(StoreError::RunExists { .. }) => {
                return Err(FlowError::Validation(format!(
                    "run id '{}' is already in use",
                    run_id
                )));
            }
            Err(e) => return Err(FlowError::infra(&run_id, e)),
        }

        let claim = inner.claim(&run_id).await?;
        self.launch(run_id, claim, mode).await
    }

    /// Continue a run from its last durable state.
    ///
    /// Terminal runs are returned as they are; the only write is a missing
    /// manifest.
    pub async fn resume(&self, run_id: &str) -> Result<RunHandle, FlowError> {
        let inner = &self.inner;
        let run = inner.load_run(run_id).await?;
        if run.status.is_terminal() {
            inner.ensure_manifest(run_id).await?;
            return Ok(RunHandle::finished(run.run_id, run.status));
        }
        tracing::info!(run_id, status = %run.status, "resuming run");
        let claim = inner.claim(run_id).await?;
        self.launch(run_id.to_string(), claim, StartMode::Blocking)
            .await
    }

    pub async fn status(&self, run_id: &str) -> Result<FlowState, FlowError> {
        Ok(self.inner.load_run(run_id).await?.status)
    }

    pub async fn result(&self, run_id: &str) -> Result<RunResult, FlowError> {
        let run = self.inner.load_run(run_id).await?;
        let id = run_id.to_string();
        let (transitions, branch_outcomes, manifest, artifacts) = self
            .inner
            .store_call(run_id, move |db| {
                Ok((
                    db.list_transitions(&id)?,
                    db.get_branch_outcomes(&id)?,
                    db.get_run_manifest(&id)?,
                    db.get_stage_output(&id, FlowNode::Artifacts)?,
                ))
            })
            .await?;

        let artifacts = artifacts
            .map(serde_json::from_value::<ArtifactPaths>)
            .transpose()
            .map_err(|e| {
                FlowError::infra(
                    run_id,
                    StoreError::Corrupt {
                        run_id: run_id.to_string(),
                        what: "artifact paths",
                        message: e.to_string(),
                    },
                )
            })?;
        let error = transitions
            .iter()
            .rev()
            .find(|t| t.to_state == FlowState::Failed)
            .map(|t| t.reason.clone());

        Ok(RunResult {
            run_id: run.run_id,
            status: run.status,
            manifest,
            error,
            branch_outcomes,
            artifacts,
        })
    }

    async fn launch(
        &self,
        run_id: String,
        claim: RunClaim,
        mode: StartMode,
    ) -> Result<RunHandle, FlowError> {
        let span = tracing::info_span!("flow_run", run_id = %run_id);
        let task = self
            .inner
            .clone()
            .drive(run_id.clone(), claim)
            .instrument(span);
        match mode {
            StartMode::Blocking => {
                let state = task.await?;
                Ok(RunHandle::finished(run_id, state))
            }
            StartMode::Detached => Ok(RunHandle {
                run_id,
                state: HandleState::Running(tokio::spawn(task)),
            }),
        }
    }
}

/// Exclusive in-process claim on a run; released on drop.
struct RunClaim {
    inner: Arc<RunnerInner>,
    run_id: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&self.run_id);
        }
    }
}

/// Errors after which the run is moved to `FAILED`.
///
/// Conflicts with another writer are excluded: the run belongs to whoever
/// wrote first and must not be touched.
fn fails_run(err: &FlowError) -> bool {
    match err {
        FlowError::Infrastructure { source, .. } => !matches!(
            source,
            StoreError::StatusMismatch { .. }
                | StoreError::SnapshotExists { .. }
                | StoreError::LeaseHeld { .. }
                | StoreError::LeaseLost { .. }
        ),
        FlowError::Invariant { .. } | FlowError::TaskAborted { .. } => true,
        _ => false,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Aborts the task when dropped, so cancelling a stage cancels its work.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Node a failure from `state` is attributed to.
fn failure_node(state: FlowState) -> FlowNode {
    match state {
        FlowState::Validated => FlowNode::Start,
        FlowState::Scanning => FlowNode::Scanner,
        FlowState::Branching | FlowState::Joining => FlowNode::Join,
        FlowState::Artifacts | FlowState::Done | FlowState::Failed => FlowNode::Artifacts,
    }
}

fn invariant(run_id: &str, message: impl Into<String>) -> FlowError {
    FlowError::Invariant {
        run_id: run_id.to_string(),
        message: message.into(),
    }
}

impl RunnerInner {
    async fn store_call<F, R>(&self, run_id: &str, f: F) -> Result<R, FlowError>
    where
        F: FnOnce(&crate::store::FlowDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(|e| FlowError::infra(run_id, e))
    }

    async fn load_run(&self, run_id: &str) -> Result<RunRecord, FlowError> {
        let id = run_id.to_string();
        self.store_call(run_id, move |db| db.get_run(&id))
            .await?
            .ok_or_else(|| FlowError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    fn executor(&self, stage: StageKind) -> RetryExecutor {
        RetryExecutor::new(self.config.retry_policy_for(stage)).with_jitter(self.jitter.clone())
    }

    /// Claim a run for this runner: in-process first, then the store lease.
    async fn claim(self: &Arc<Self>, run_id: &str) -> Result<RunClaim, FlowError> {
        {
            let mut active = self.active.lock().map_err(|_| {
                FlowError::infra(run_id, StoreError::LockPoisoned)
            })?;
            if !active.insert(run_id.to_string()) {
                return Err(FlowError::RunBusy {
                    run_id: run_id.to_string(),
                });
            }
        }
        let claim = RunClaim {
            inner: self.clone(),
            run_id: run_id.to_string(),
        };
        let id = run_id.to_string();
        let owner = self.owner.clone();
        let ttl = self.config.lease.ttl();
        match self.db.call(move |db| db.acquire_lease(&id, &owner, ttl)).await {
            Ok(_) => Ok(claim),
            Err(StoreError::LeaseHeld { owner, expires_at, .. }) => {
                tracing::warn!(run_id, holder = %owner, %expires_at, "run is leased elsewhere");
                Err(FlowError::RunBusy {
                    run_id: run_id.to_string(),
                })
            }
            Err(e) => Err(FlowError::infra(run_id, e)),
        }
    }

    /// Extend the lease this runner holds; `LeaseLost` once it is gone.
    async fn renew_lease(&self, run_id: &str) -> Result<(), FlowError> {
        let id = run_id.to_string();
        let owner = self.owner.clone();
        let ttl = self.config.lease.ttl();
        self.store_call(run_id, move |db| db.renew_lease(&id, &owner, ttl))
            .await
            .map(|_| ())
    }

    /// Renew the lease every `lease.heartbeat()` until it is lost.
    async fn heartbeat(self: Arc<Self>, run_id: String) -> FlowError {
        let interval = self.config.lease.heartbeat();
        loop {
            tokio::time::sleep(interval).await;
            match self.renew_lease(&run_id).await {
                Ok(()) => {}
                Err(err @ FlowError::LeaseLost { .. }) => {
                    tracing::warn!(run_id = %run_id, "lease lost; stopping run");
                    return err;
                }
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "lease renewal failed");
                }
            }
        }
    }

    /// Mark a transition as valid only while this runner holds the lease.
    fn fenced(&self, transition: NewTransition) -> NewTransition {
        transition.fenced_by(self.owner.clone())
    }

    async fn release_lease(&self, run_id: &str) {
        let id = run_id.to_string();
        let owner = self.owner.clone();
        if let Err(e) = self.db.call(move |db| db.release_lease(&id, &owner)).await {
            tracing::warn!(run_id, error = %e, "failed to release run lease");
        }
    }

    /// Append a transition, then tell the observer.
    async fn transition(
        &self,
        run_id: &str,
        transition: NewTransition,
    ) -> Result<TransitionRecord, FlowError> {
        let id = run_id.to_string();
        let transition = self.fenced(transition);
        let record = self
            .store_call(run_id, move |db| db.append_transition(&id, &transition))
            .await?;
        notify(self.observer.as_ref(), &record);
        Ok(record)
    }

    async fn drive(self: Arc<Self>, run_id: String, claim: RunClaim) -> Result<FlowState, FlowError> {
        let mut heartbeat = AbortOnDrop(tokio::spawn(self.clone().heartbeat(run_id.clone())));
        let outcome = tokio::select! {
            result = self.drive_stages(&run_id) => result,
            Ok(lost) = &mut heartbeat.0 => Err(lost),
        };
        drop(heartbeat);

        let result = match outcome {
            Err(err) if fails_run(&err) => {
                self.fail_after_error(&run_id, &err).await;
                Err(err)
            }
            other => other,
        };
        self.release_lease(&run_id).await;
        drop(claim);
        if let Ok(state) = &result {
            tracing::info!(run_id = %run_id, state = %state, "run finished");
        }
        result
    }

    async fn drive_stages(self: &Arc<Self>, run_id: &str) -> Result<FlowState, FlowError> {
        loop {
            let run = self.load_run(run_id).await?;
            match run.status {
                FlowState::Validated => {
                    self.transition(
                        run_id,
                        NewTransition::new(
                            FlowNode::Scanner,
                            FlowState::Validated,
                            FlowState::Scanning,
                            "scan dispatched",
                        ),
                    )
                    .await?;
                }
                FlowState::Scanning => self.scan_stage(&run).await?,
                FlowState::Branching => self.branch_stage(&run).await?,
                FlowState::Joining => self.join_stage(&run).await?,
                FlowState::Artifacts => self.artifacts_stage(&run).await?,
                FlowState::Done | FlowState::Failed => {
                    self.ensure_manifest(run_id).await?;
                    return Ok(run.status);
                }
            }
            self.renew_lease(run_id).await?;
        }
    }

    /// Record a stage failure as `from -> FAILED`.
    async fn fail_stage(
        &self,
        run_id: &str,
        node: FlowNode,
        from: FlowState,
        failure: &RetryFailure,
    ) -> Result<(), FlowError> {
        self.transition(
            run_id,
            NewTransition::new(node, from, FlowState::Failed, failure.to_string())
                .with_attempts(failure.attempts()),
        )
        .await?;
        Ok(())
    }

    async fn scan_stage(&self, run: &RunRecord) -> Result<(), FlowError> {
        let run_id = run.run_id.as_str();
        tracing::info!(run_id, scanner = %self.adapters.scanner.name(), "scan started");
        let scanner = &self.adapters.scanner;
        let policy = &self.config.scan_policy;
        let result = self
            .executor(StageKind::Scan)
            .run("scanner", |_| scanner.scan(&run.target, policy))
            .await;

        match result {
            Ok(success) => {
                let id = run_id.to_string();
                let transition = self.fenced(
                    NewTransition::new(
                        FlowNode::Scanner,
                        FlowState::Scanning,
                        FlowState::Branching,
                        "scan succeeded",
                    )
                    .with_attempts(success.attempts),
                );
                let snapshot = success.value;
                let record = self
                    .store_call(run_id, move |db| db.commit_scan(&id, &snapshot, &transition))
                    .await?;
                notify(self.observer.as_ref(), &record);
                Ok(())
            }
            Err(failure) => {
                tracing::warn!(run_id, error = %failure, "scan failed");
                self.fail_stage(run_id, FlowNode::Scanner, FlowState::Scanning, &failure)
                    .await
            }
        }
    }

    async fn branch_stage(self: &Arc<Self>, run: &RunRecord) -> Result<(), FlowError> {
        let run_id = run.run_id.as_str();
        let id = run_id.to_string();
        let (snapshot, existing) = self
            .store_call(run_id, move |db| {
                Ok((db.get_scanner_snapshot(&id)?, db.get_branch_outcomes(&id)?))
            })
            .await?;
        let snapshot = Arc::new(
            snapshot.ok_or_else(|| invariant(run_id, "run is branching but has no scanner snapshot"))?,
        );

        let pending: Vec<BranchKind> = BranchKind::ALL
            .into_iter()
            .filter(|kind| !existing.iter().any(|r| r.branch == *kind))
            .collect();
        if !pending.is_empty() {
            tracing::info!(
                run_id,
                pending = ?pending.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
                "dispatching branches"
            );
        }

        let mut tasks: Vec<_> = pending
            .into_iter()
            .map(|kind| {
                let inner = self.clone();
                let snapshot = snapshot.clone();
                let config = BranchConfig {
                    run_id: run.run_id.clone(),
                    kind,
                    provider_profile: run.provider_profile.clone(),
                };
                AbortOnDrop(tokio::spawn(
                    inner
                        .run_branch(config, snapshot)
                        .instrument(tracing::info_span!("branch", branch = kind.as_str())),
                ))
            })
            .collect();

        let mut first_error = None;
        for joined in join_all(tasks.iter_mut().map(|task| &mut task.0)).await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(FlowError::TaskAborted {
                    run_id: run_id.to_string(),
                    message: e.to_string(),
                })
            });
            if let Err(e) = outcome
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let id = run_id.to_string();
        let records = self.store_call(run_id, move |db| db.get_branch_outcomes(&id)).await?;
        let outcomes = BranchOutcomes::from_parts(records.into_iter().map(|r| (r.branch, r.outcome)))
            .ok_or_else(|| invariant(run_id, "branch barrier reached with missing outcomes"))?;

        let succeeded = outcomes.count(BranchStatus::Succeeded);
        let degraded = outcomes.count(BranchStatus::Degraded);
        let failed = outcomes.count(BranchStatus::Failed);
        let max_failed = self.config.branches.max_failed;

        let transition = if failed > max_failed {
            let reasons: Vec<String> = outcomes
                .iter()
                .filter(|(_, o)| o.status() == BranchStatus::Failed)
                .map(|(kind, o)| format!("{}: {}", kind, o.reason().unwrap_or("unknown")))
                .collect();
            tracing::warn!(run_id, failed, max_failed, "too many branches failed");
            NewTransition::new(
                FlowNode::Join,
                FlowState::Branching,
                FlowState::Failed,
                format!(
                    "{} branches failed (max {}): {}",
                    failed,
                    max_failed,
                    reasons.join("; ")
                ),
            )
        } else {
            NewTransition::new(
                FlowNode::Join,
                FlowState::Branching,
                FlowState::Joining,
                format!(
                    "all branches resolved ({} succeeded, {} degraded, {} failed)",
                    succeeded, degraded, failed
                ),
            )
        };
        self.transition(run_id, transition).await?;
        Ok(())
    }

    /// Run one branch to its terminal outcome and commit it.
    async fn run_branch(
        self: Arc<Self>,
        config: BranchConfig,
        snapshot: Arc<ScannerSnapshot>,
    ) -> Result<(), FlowError> {
        let kind = config.kind;
        let adapter = self.adapters.branch(kind);
        // A panicking adapter is a terminal failure of its own branch only.
        let result = self
            .executor(StageKind::Branch)
            .run(kind.as_str(), |_| {
                AssertUnwindSafe(adapter.analyze(&snapshot, &config))
                    .catch_unwind()
                    .map(|caught| {
                        caught.unwrap_or_else(|panic| {
                            Err(StageError::terminal(format!(
                                "adapter panicked: {}",
                                panic_message(&*panic)
                            )))
                        })
                    })
            })
            .await;

        let (outcome, attempts) = match result {
            Ok(success) => (
                BranchOutcome::Succeeded {
                    payload: success.value,
                },
                success.attempts,
            ),
            Err(failure @ RetryFailure::Exhausted { .. }) => {
                let reason = failure.to_string();
                (
                    BranchOutcome::Degraded {
                        payload: adapter.placeholder(kind, &reason),
                        reason,
                    },
                    failure.attempts(),
                )
            }
            Err(failure @ RetryFailure::Terminal { .. }) => (
                BranchOutcome::Failed {
                    reason: failure.to_string(),
                },
                failure.attempts(),
            ),
        };

        let reason = match outcome.reason() {
            Some(reason) => format!("branch {}: {}", outcome.status(), reason),
            None => format!("branch {}", outcome.status()),
        };
        tracing::info!(
            run_id = %config.run_id,
            branch = kind.as_str(),
            status = %outcome.status(),
            attempts,
            "branch resolved"
        );

        let run_id = config.run_id;
        let id = run_id.clone();
        let record = BranchRecord::new(kind, outcome, attempts);
        let transition = self.fenced(
            NewTransition::new(
                FlowNode::Branch(kind),
                FlowState::Branching,
                FlowState::Branching,
                reason,
            )
            .with_attempts(attempts),
        );
        let committed = self
            .store_call(&run_id, move |db| db.commit_branch(&id, &record, &transition))
            .await?;
        notify(self.observer.as_ref(), &committed);
        Ok(())
    }

    async fn join_stage(&self, run: &RunRecord) -> Result<(), FlowError> {
        let run_id = run.run_id.as_str();
        let id = run_id.to_string();
        let records = self.store_call(run_id, move |db| db.get_branch_outcomes(&id)).await?;
        let outcomes = BranchOutcomes::from_parts(records.into_iter().map(|r| (r.branch, r.outcome)))
            .ok_or_else(|| invariant(run_id, "run is joining without three branch outcomes"))?;

        tracing::info!(run_id, join = %self.adapters.join.name(), "synthesis started");
        let join = &self.adapters.join;
        let result = self
            .executor(StageKind::Join)
            .run("join", |_| join.synthesize(&outcomes))
            .await;

        match result {
            Ok(success) => {
                let id = run_id.to_string();
                let payload = success.value;
                let transition = self.fenced(
                    NewTransition::new(
                        FlowNode::Join,
                        FlowState::Joining,
                        FlowState::Artifacts,
                        "synthesis succeeded",
                    )
                    .with_attempts(success.attempts),
                );
                let record = self
                    .store_call(run_id, move |db| {
                        db.commit_stage_output(&id, FlowNode::Join, &payload, &transition)
                    })
                    .await?;
                notify(self.observer.as_ref(), &record);
                Ok(())
            }
            Err(failure) => {
                tracing::warn!(run_id, error = %failure, "synthesis failed");
                self.fail_stage(run_id, FlowNode::Join, FlowState::Joining, &failure)
                    .await
            }
        }
    }

    async fn artifacts_stage(&self, run: &RunRecord) -> Result<(), FlowError> {
        let run_id = run.run_id.as_str();
        let id = run_id.to_string();
        let (snapshot, records, synthesis) = self
            .store_call(run_id, move |db| {
                Ok((
                    db.get_scanner_snapshot(&id)?,
                    db.get_branch_outcomes(&id)?,
                    db.get_stage_output(&id, FlowNode::Join)?,
                ))
            })
            .await?;
        let input = ArtifactInput {
            run_id: run.run_id.clone(),
            repo_name: run.repo_name.clone(),
            resolved_path: run.target.resolved_path.clone(),
            snapshot: snapshot.ok_or_else(|| invariant(run_id, "artifacts stage without snapshot"))?,
            outcomes: BranchOutcomes::from_parts(records.into_iter().map(|r| (r.branch, r.outcome)))
                .ok_or_else(|| invariant(run_id, "artifacts stage without branch outcomes"))?,
            synthesis: synthesis
                .ok_or_else(|| invariant(run_id, "artifacts stage without synthesis output"))?,
        };

        let materializer = &self.adapters.artifacts;
        let result = self
            .executor(StageKind::Artifacts)
            .run("artifacts", |_| materializer.materialize(&input))
            .await;

        match result {
            Ok(success) => {
                let id = run_id.to_string();
                let paths: Value = serde_json::to_value(&success.value)
                    .map_err(|e| FlowError::infra(run_id, StoreError::Encode(e)))?;
                let transition = self.fenced(
                    NewTransition::new(
                        FlowNode::Artifacts,
                        FlowState::Artifacts,
                        FlowState::Done,
                        format!("{} artifact(s) materialized", success.value.files.len()),
                    )
                    .with_attempts(success.attempts),
                );
                let record = self
                    .store_call(run_id, move |db| {
                        db.commit_stage_output(&id, FlowNode::Artifacts, &paths, &transition)
                    })
                    .await?;
                notify(self.observer.as_ref(), &record);
                Ok(())
            }
            Err(failure) => {
                tracing::warn!(run_id, error = %failure, "artifact materialization failed");
                self.fail_stage(run_id, FlowNode::Artifacts, FlowState::Artifacts, &failure)
                    .await
            }
        }
    }

    /// Write the manifest of a terminal run unless it already has one.
    async fn ensure_manifest(&self, run_id: &str) -> Result<(), FlowError> {
        let id = run_id.to_string();
        let config = self.config.clone();
        let adapters = self.adapter_names.clone();
        let tool_versions = self.tool_versions.clone();
        self.store_call(run_id, move |db| {
            if db.get_run_manifest(&id)?.is_some() {
                return Ok(());
            }
            let run = db.get_run(&id)?.ok_or_else(|| StoreError::RunNotFound {
                run_id: id.clone(),
            })?;
            if !run.status.is_terminal() {
                return Ok(());
            }
            let manifest = build_manifest(
                &run,
                &db.list_transitions(&id)?,
                &db.get_branch_outcomes(&id)?,
                &config,
                &adapters,
                &tool_versions,
            );
            match db.put_run_manifest(&id, &redact_value(&serde_json::to_value(&manifest)?)) {
                Ok(_) | Err(StoreError::ManifestExists { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Best-effort `-> FAILED` after an infrastructure or invariant error.
    /// Fenced like every other write: a runner that lost the lease never
    /// fails someone else's run.
    async fn fail_after_error(&self, run_id: &str, err: &FlowError) {
        tracing::error!(run_id, error = %err, "run aborted");
        let id = run_id.to_string();
        let reason = format!("unrecoverable: {}", err);
        let owner = self.owner.clone();
        let appended = self
            .db
            .call(move |db| {
                let Some(run) = db.get_run(&id)? else {
                    return Ok(None);
                };
                if run.status.is_terminal() {
                    return Ok(None);
                }
                let transition = NewTransition::new(
                    failure_node(run.status),
                    run.status,
                    FlowState::Failed,
                    reason,
                )
                .fenced_by(owner);
                db.append_transition(&id, &transition).map(Some)
            })
            .await;

        match appended {
            Ok(Some(record)) => {
                notify(self.observer.as_ref(), &record);
                if let Err(e) = self.ensure_manifest(run_id).await {
                    tracing::warn!(run_id, error = %e, "failed to write manifest for aborted run");
                }
            }
            Ok(None) => {}
            Err(StoreError::LeaseLost { .. }) => {
                tracing::warn!(run_id, "lease lost; run left to its current holder");
            }
            Err(e) => {
                tracing::warn!(run_id, error = %e, "could not record run failure");
            }
        }
    }
}
