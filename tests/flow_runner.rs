//! End-to-end tests for the flow runner against a real SQLite store and
//! scripted adapters.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use repoclinic::config::FlowConfig;
use repoclinic::errors::{FlowError, StageError, StoreError};
use repoclinic::flow::state::is_valid_edge;
use repoclinic::flow::{
    Adapters, AnalyzeRequest, FlowNode, FlowRunner, FlowState, StartMode, TransitionObserver,
};
use repoclinic::retry::RetryPolicy;
use repoclinic::stage::{
    ArtifactInput, ArtifactMaterializer, ArtifactPaths, BranchAdapter, BranchConfig, BranchKind,
    BranchOutcome, BranchOutcomes, BranchPayload, BranchStatus, JoinAdapter, ResolvedTarget,
    ScanAdapter, ScanPolicy, ScannerSnapshot, SourceKind, SynthesisPayload,
};
use repoclinic::store::{
    BranchRecord, DbHandle, FlowDb, NewRun, NewTransition, SnapshotWrite, TransitionRecord,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Notify;

// =============================================================================
// Scripted adapters
// =============================================================================

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    /// Always fails with a retryable error.
    Flaky,
    /// Fails with a terminal error.
    Broken,
    /// Never returns within any reasonable timeout.
    Hang,
    /// Succeeds after a real-time delay.
    Slow(Duration),
    Panic,
}

async fn play(script: Script) -> Result<(), StageError> {
    match script {
        Script::Succeed => Ok(()),
        Script::Flaky => Err(StageError::retryable("upstream rate limited")),
        Script::Broken => Err(StageError::terminal("schema violation in model output")),
        Script::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
        Script::Slow(delay) => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        Script::Panic => panic!("adapter bug"),
    }
}

struct MockScan {
    calls: Arc<AtomicUsize>,
    script: Script,
}

#[async_trait]
impl ScanAdapter for MockScan {
    fn name(&self) -> &str {
        "mock-scanner"
    }

    async fn scan(
        &self,
        target: &ResolvedTarget,
        policy: &ScanPolicy,
    ) -> Result<ScannerSnapshot, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        play(self.script).await?;
        Ok(ScannerSnapshot::new(json!({
            "repo": target.repo_name,
            "max_files": policy.max_files,
        })))
    }
}

struct MockBranch {
    calls: Arc<AtomicUsize>,
    script: Script,
}

#[async_trait]
impl BranchAdapter for MockBranch {
    fn name(&self) -> &str {
        "mock-branch"
    }

    async fn analyze(
        &self,
        snapshot: &ScannerSnapshot,
        config: &BranchConfig,
    ) -> Result<BranchPayload, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        play(self.script).await?;
        Ok(json!({
            "branch": config.kind.as_str(),
            "repo": snapshot.payload["repo"],
            "findings": [],
        }))
    }
}

/// Branch that blocks until its gate is opened.
struct GatedBranch {
    calls: Arc<AtomicUsize>,
    gate: Arc<Notify>,
}

#[async_trait]
impl BranchAdapter for GatedBranch {
    fn name(&self) -> &str {
        "mock-branch"
    }

    async fn analyze(
        &self,
        _snapshot: &ScannerSnapshot,
        config: &BranchConfig,
    ) -> Result<BranchPayload, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(json!({ "branch": config.kind.as_str(), "gated": true }))
    }
}

struct MockJoin {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Option<BranchOutcomes>>>,
    script: Script,
}

#[async_trait]
impl JoinAdapter for MockJoin {
    fn name(&self) -> &str {
        "mock-join"
    }

    async fn synthesize(&self, outcomes: &BranchOutcomes) -> Result<SynthesisPayload, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some(outcomes.clone());
        play(self.script).await?;
        Ok(json!({ "roadmap": ["tighten auth"] }))
    }
}

struct MockArtifacts {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ArtifactMaterializer for MockArtifacts {
    fn name(&self) -> &str {
        "mock-artifacts"
    }

    async fn materialize(&self, input: &ArtifactInput) -> Result<ArtifactPaths, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactPaths {
            files: vec![input.resolved_path.join("report.md")],
        })
    }
}

#[derive(Default, Clone)]
struct Calls {
    scan: Arc<AtomicUsize>,
    architecture: Arc<AtomicUsize>,
    security: Arc<AtomicUsize>,
    performance: Arc<AtomicUsize>,
    join: Arc<AtomicUsize>,
    artifacts: Arc<AtomicUsize>,
}

impl Calls {
    fn get(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn branch_total(&self) -> usize {
        Self::get(&self.architecture) + Self::get(&self.security) + Self::get(&self.performance)
    }
}

struct Scripts {
    scan: Script,
    architecture: Script,
    security: Script,
    performance: Script,
    join: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            scan: Script::Succeed,
            architecture: Script::Succeed,
            security: Script::Succeed,
            performance: Script::Succeed,
            join: Script::Succeed,
        }
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    dir: TempDir,
    repo: std::path::PathBuf,
    db: DbHandle,
    calls: Calls,
    seen: Arc<Mutex<Option<BranchOutcomes>>>,
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(1))
        .with_jitter_fraction(0.0)
}

fn fast_config() -> FlowConfig {
    let mut config = FlowConfig::default();
    config.retries.scan = fast_policy().with_max_attempts(2);
    config.retries.branch = fast_policy().with_max_attempts(3);
    config.retries.join = fast_policy().with_max_attempts(2);
    config.retries.artifacts = fast_policy().with_max_attempts(2);
    config
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("widgets");
        std::fs::create_dir(&repo).unwrap();
        let db = DbHandle::new(FlowDb::new(&dir.path().join("state/flow.db")).unwrap());
        Self {
            dir,
            repo,
            db,
            calls: Calls::default(),
            seen: Arc::new(Mutex::new(None)),
        }
    }

    fn runner(&self, scripts: Scripts) -> FlowRunner {
        self.runner_with(fast_config(), scripts)
    }

    fn runner_with(&self, config: FlowConfig, scripts: Scripts) -> FlowRunner {
        FlowRunner::new(config, self.db.clone(), self.adapters(scripts)).unwrap()
    }

    fn adapters(&self, scripts: Scripts) -> Adapters {
        let branch = |calls: &Arc<AtomicUsize>, script| -> Arc<dyn BranchAdapter> {
            Arc::new(MockBranch {
                calls: calls.clone(),
                script,
            })
        };
        Adapters {
            scanner: Arc::new(MockScan {
                calls: self.calls.scan.clone(),
                script: scripts.scan,
            }),
            architecture: branch(&self.calls.architecture, scripts.architecture),
            security: branch(&self.calls.security, scripts.security),
            performance: branch(&self.calls.performance, scripts.performance),
            join: Arc::new(MockJoin {
                calls: self.calls.join.clone(),
                seen: self.seen.clone(),
                script: scripts.join,
            }),
            artifacts: Arc::new(MockArtifacts {
                calls: self.calls.artifacts.clone(),
            }),
        }
    }

    fn request(&self, run_id: &str) -> AnalyzeRequest {
        AnalyzeRequest::local(&self.repo).with_run_id(run_id)
    }

    async fn transitions(&self, run_id: &str) -> Vec<TransitionRecord> {
        let id = run_id.to_string();
        self.db.call(move |db| db.list_transitions(&id)).await.unwrap()
    }

    async fn branch_outcomes(&self, run_id: &str) -> Vec<(BranchKind, BranchOutcome, u32)> {
        let id = run_id.to_string();
        self.db
            .call(move |db| db.get_branch_outcomes(&id))
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.branch, r.outcome, r.attempts))
            .collect()
    }

    /// Poll the log until `count` branches have recorded their outcome.
    async fn wait_for_branch_resolutions(&self, run_id: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let resolved = self
                    .transitions(run_id)
                    .await
                    .iter()
                    .filter(|t| matches!(t.node, FlowNode::Branch(_)))
                    .count();
                if resolved >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("branches should resolve");
    }

    /// Rewrite a run's lease through a second connection, the way another
    /// process would see it.
    fn set_lease(&self, run_id: &str, owner: Option<&str>, expires_at: &str) {
        let conn = rusqlite::Connection::open(self.dir.path().join("state/flow.db")).unwrap();
        conn.busy_timeout(Duration::from_secs(5)).unwrap();
        match owner {
            Some(owner) => conn.execute(
                "UPDATE run_leases SET owner = ?1, expires_at = ?2 WHERE run_id = ?3",
                rusqlite::params![owner, expires_at, run_id],
            ),
            None => conn.execute(
                "UPDATE run_leases SET expires_at = ?1 WHERE run_id = ?2",
                rusqlite::params![expires_at, run_id],
            ),
        }
        .unwrap();
    }

    /// Put a run into `BRANCHING` with a snapshot, as if a previous process
    /// had scanned it and then died.
    fn seed_branching_run(&self, run_id: &str) {
        let db = self.db.lock_sync().unwrap();
        db.create_run(&NewRun {
            schema_version: "1.0.0".into(),
            provider_profile: "openai-default".into(),
            target: ResolvedTarget {
                run_id: run_id.into(),
                repo_name: "widgets".into(),
                resolved_path: self.repo.clone(),
                source: SourceKind::LocalPath,
                url: None,
                branch: None,
                commit: None,
            },
        })
        .unwrap();
        db.append_transition(
            run_id,
            &NewTransition::new(
                FlowNode::Scanner,
                FlowState::Validated,
                FlowState::Scanning,
                "scan dispatched",
            ),
        )
        .unwrap();
        db.commit_scan(
            run_id,
            &ScannerSnapshot::new(json!({"repo": "widgets"})),
            &NewTransition::new(
                FlowNode::Scanner,
                FlowState::Scanning,
                FlowState::Branching,
                "scan succeeded",
            )
            .with_attempts(1),
        )
        .unwrap();
    }
}

fn assert_log_follows_table(log: &[TransitionRecord]) {
    assert!(!log.is_empty());
    assert_eq!(log[0].from_state, FlowState::Validated);
    for pair in log.windows(2) {
        assert!(pair[0].seq < pair[1].seq, "sequence must increase");
        assert!(pair[0].timestamp <= pair[1].timestamp, "timestamps must not go back");
        assert_eq!(pair[0].to_state, pair[1].from_state, "log must be contiguous");
    }
    for t in log {
        assert!(
            is_valid_edge(t.from_state, t.to_state),
            "{} -> {} is not in the transition table",
            t.from_state,
            t.to_state
        );
    }
}

// =============================================================================
// Happy path and idempotency
// =============================================================================

#[tokio::test]
async fn test_run_completes_and_records_every_stage() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());

    let handle = runner
        .start(fx.request("happy-1"), StartMode::Blocking)
        .await
        .unwrap();
    assert_eq!(handle.terminal_state(), Some(FlowState::Done));
    assert_eq!(handle.wait().await.unwrap(), FlowState::Done);

    assert_eq!(Calls::get(&fx.calls.scan), 1);
    assert_eq!(fx.calls.branch_total(), 3);
    assert_eq!(Calls::get(&fx.calls.join), 1);
    assert_eq!(Calls::get(&fx.calls.artifacts), 1);

    let log = fx.transitions("happy-1").await;
    assert_log_follows_table(&log);
    // dispatch, scan, three branch resolutions, barrier, join, artifacts
    assert_eq!(log.len(), 8);
    assert_eq!(log.last().unwrap().to_state, FlowState::Done);
    let branch_nodes: Vec<_> = log
        .iter()
        .filter(|t| matches!(t.node, FlowNode::Branch(_)))
        .collect();
    assert_eq!(branch_nodes.len(), 3);

    let result = runner.result("happy-1").await.unwrap();
    assert_eq!(result.status, FlowState::Done);
    assert!(result.error.is_none());
    assert_eq!(result.branch_outcomes.len(), 3);
    assert!(
        result
            .branch_outcomes
            .iter()
            .all(|b| b.outcome.status() == BranchStatus::Succeeded)
    );
    assert_eq!(result.artifacts.unwrap().files, vec![fx.repo.canonicalize().unwrap().join("report.md")]);

    let manifest = result.manifest.expect("manifest written at terminal state");
    assert_eq!(manifest.payload["final_state"], "DONE");
    assert_eq!(manifest.payload["adapters"]["join"], "mock-join");
    assert_eq!(manifest.payload["stage_attempts"]["scanner"], 1);
    assert_eq!(manifest.payload["analysis_status"]["security"], "succeeded");
}

#[tokio::test]
async fn test_resume_of_finished_run_executes_nothing() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());
    runner
        .start(fx.request("idem-1"), StartMode::Blocking)
        .await
        .unwrap();
    let before = fx.transitions("idem-1").await;

    for _ in 0..3 {
        let handle = runner.resume("idem-1").await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), FlowState::Done);
    }

    assert_eq!(Calls::get(&fx.calls.scan), 1);
    assert_eq!(fx.calls.branch_total(), 3);
    assert_eq!(Calls::get(&fx.calls.join), 1);
    assert_eq!(Calls::get(&fx.calls.artifacts), 1);
    assert_eq!(fx.transitions("idem-1").await, before);
}

#[tokio::test]
async fn test_resume_repairs_missing_manifest() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());
    runner
        .start(fx.request("repair-1"), StartMode::Blocking)
        .await
        .unwrap();
    // Simulate a crash between the terminal transition and the manifest
    // write by removing the manifest through a second connection.
    {
        let path = fx.dir.path().join("state/flow.db");
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute("DELETE FROM run_manifests WHERE run_id = 'repair-1'", [])
            .unwrap();
    }

    runner.resume("repair-1").await.unwrap();
    let manifest = fx
        .db
        .call(|db| db.get_run_manifest("repair-1"))
        .await
        .unwrap();
    assert!(manifest.is_some());
    assert_eq!(Calls::get(&fx.calls.scan), 1);
}

// =============================================================================
// Resume after crash
// =============================================================================

#[tokio::test]
async fn test_resume_mid_branching_runs_only_missing_branches() {
    let fx = Fixture::new();
    fx.seed_branching_run("crash-1");
    fx.db
        .lock_sync()
        .unwrap()
        .commit_branch(
            "crash-1",
            &BranchRecord::new(
                BranchKind::Security,
                BranchOutcome::Succeeded {
                    payload: json!({"findings": ["stored before crash"]}),
                },
                1,
            ),
            &NewTransition::new(
                FlowNode::Branch(BranchKind::Security),
                FlowState::Branching,
                FlowState::Branching,
                "branch succeeded",
            )
            .with_attempts(1),
        )
        .unwrap();

    let runner = fx.runner(Scripts::default());
    let state = runner.resume("crash-1").await.unwrap().wait().await.unwrap();
    assert_eq!(state, FlowState::Done);

    assert_eq!(Calls::get(&fx.calls.scan), 0);
    assert_eq!(Calls::get(&fx.calls.security), 0);
    assert_eq!(Calls::get(&fx.calls.architecture), 1);
    assert_eq!(Calls::get(&fx.calls.performance), 1);
    assert_eq!(Calls::get(&fx.calls.join), 1);

    let seen = fx.seen.lock().unwrap().clone().unwrap();
    assert_eq!(
        seen.security.payload().unwrap()["findings"][0],
        "stored before crash"
    );
    assert_log_follows_table(&fx.transitions("crash-1").await);
}

#[tokio::test]
async fn test_resume_in_validated_dispatches_scan() {
    let fx = Fixture::new();
    fx.db
        .lock_sync()
        .unwrap()
        .create_run(&NewRun {
            schema_version: "1.0.0".into(),
            provider_profile: "openai-default".into(),
            target: ResolvedTarget {
                run_id: "fresh-1".into(),
                repo_name: "widgets".into(),
                resolved_path: fx.repo.clone(),
                source: SourceKind::LocalPath,
                url: None,
                branch: None,
                commit: None,
            },
        })
        .unwrap();

    let runner = fx.runner(Scripts::default());
    let state = runner.resume("fresh-1").await.unwrap().wait().await.unwrap();
    assert_eq!(state, FlowState::Done);
    assert_eq!(Calls::get(&fx.calls.scan), 1);
}

#[tokio::test]
async fn test_killed_run_resumes_to_same_result_as_uninterrupted_run() {
    let reference = Fixture::new();
    let expected_state = reference
        .runner(Scripts::default())
        .start(reference.request("kill-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let expected = reference.branch_outcomes("kill-1").await;

    let fx = Fixture::new();
    let gate = Arc::new(Notify::new());
    let gated_calls = Arc::new(AtomicUsize::new(0));
    let mut adapters = fx.adapters(Scripts::default());
    adapters.security = Arc::new(GatedBranch {
        calls: gated_calls.clone(),
        gate: gate.clone(),
    });
    let doomed = FlowRunner::new(fast_config(), fx.db.clone(), adapters).unwrap();
    let handle = doomed
        .start(fx.request("kill-1"), StartMode::Detached)
        .await
        .unwrap();

    fx.wait_for_branch_resolutions("kill-1", 2).await;
    handle.abort().await;
    assert_eq!(doomed.status("kill-1").await.unwrap(), FlowState::Branching);
    assert_eq!(Calls::get(&gated_calls), 1);
    // The dead process never released its lease; let it lapse.
    fx.set_lease("kill-1", None, "1970-01-01T00:00:00.000000Z");

    let state = fx
        .runner(Scripts::default())
        .resume("kill-1")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, expected_state);
    assert_eq!(fx.branch_outcomes("kill-1").await, expected);

    assert_eq!(Calls::get(&fx.calls.scan), 1);
    assert_eq!(Calls::get(&fx.calls.architecture), 1);
    assert_eq!(Calls::get(&fx.calls.performance), 1);
    assert_eq!(Calls::get(&fx.calls.security), 1);
    assert_eq!(Calls::get(&gated_calls), 1);
    assert_log_follows_table(&fx.transitions("kill-1").await);
}

// =============================================================================
// Failure containment
// =============================================================================

#[tokio::test]
async fn test_panicking_branch_adapter_fails_only_its_branch() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        security: Script::Panic,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("panic-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Done);
    // Panics are not retried.
    assert_eq!(Calls::get(&fx.calls.security), 1);
    assert_eq!(Calls::get(&fx.calls.join), 1);

    let seen = fx.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.architecture.status(), BranchStatus::Succeeded);
    assert_eq!(seen.performance.status(), BranchStatus::Succeeded);
    assert_eq!(seen.security.status(), BranchStatus::Failed);
    let reason = seen.security.reason().unwrap();
    assert!(reason.contains("adapter panicked: adapter bug"), "{}", reason);
}

#[tokio::test]
async fn test_exhausted_branch_degrades_without_failing_run() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        security: Script::Flaky,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("partial-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Done);
    assert_eq!(Calls::get(&fx.calls.security), 3);
    assert_eq!(Calls::get(&fx.calls.join), 1);

    let seen = fx.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.architecture.status(), BranchStatus::Succeeded);
    assert_eq!(seen.performance.status(), BranchStatus::Succeeded);
    match &seen.security {
        BranchOutcome::Degraded { payload, reason } => {
            assert_eq!(payload["status"], "degraded");
            assert_eq!(payload["branch"], "security");
            assert!(reason.contains("after 3 attempt(s)"), "{}", reason);
        }
        other => panic!("Expected Degraded, got {:?}", other),
    }

    let manifest = runner.result("partial-1").await.unwrap().manifest.unwrap();
    assert_eq!(manifest.payload["analysis_status"]["security"], "degraded");
    assert_eq!(manifest.payload["stage_attempts"]["security"], 3);
    assert!(manifest.payload["branch_failures"]["security"].is_string());
}

#[tokio::test]
async fn test_timed_out_branch_degrades() {
    let fx = Fixture::new();
    let mut config = fast_config();
    config.retries.branch = fast_policy()
        .with_max_attempts(2)
        .with_timeout(Duration::from_millis(50));
    let runner = fx.runner_with(
        config,
        Scripts {
            performance: Script::Hang,
            ..Scripts::default()
        },
    );

    let state = runner
        .start(fx.request("slow-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Done);
    assert_eq!(Calls::get(&fx.calls.performance), 2);
    let seen = fx.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.performance.status(), BranchStatus::Degraded);
    assert!(seen.performance.reason().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_single_terminal_branch_failure_is_tolerated() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        architecture: Script::Broken,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("one-bad"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Done);
    // Terminal errors are not retried.
    assert_eq!(Calls::get(&fx.calls.architecture), 1);
    let seen = fx.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.architecture.status(), BranchStatus::Failed);
}

#[tokio::test]
async fn test_failed_branches_over_cap_fail_run_before_join() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        architecture: Script::Broken,
        performance: Script::Broken,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("two-bad"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Failed);
    assert_eq!(Calls::get(&fx.calls.join), 0);
    assert_eq!(Calls::get(&fx.calls.artifacts), 0);

    let result = runner.result("two-bad").await.unwrap();
    let error = result.error.unwrap();
    assert!(error.contains("2 branches failed (max 1)"), "{}", error);
    assert_eq!(result.branch_outcomes.len(), 3);

    let log = fx.transitions("two-bad").await;
    assert_log_follows_table(&log);
    let last = log.last().unwrap();
    assert_eq!((last.from_state, last.to_state), (FlowState::Branching, FlowState::Failed));
}

#[tokio::test]
async fn test_scan_failure_never_dispatches_branches() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        scan: Script::Flaky,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("noscan-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Failed);
    assert_eq!(Calls::get(&fx.calls.scan), 2);
    assert_eq!(fx.calls.branch_total(), 0);
    assert_eq!(Calls::get(&fx.calls.join), 0);

    let log = fx.transitions("noscan-1").await;
    assert_log_follows_table(&log);
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].attempts, Some(2));

    let result = runner.result("noscan-1").await.unwrap();
    assert!(result.error.unwrap().contains("scanner failed after 2 attempt(s)"));
    assert!(result.branch_outcomes.is_empty());
    assert_eq!(result.manifest.unwrap().payload["final_state"], "FAILED");
}

#[tokio::test]
async fn test_join_failure_fails_run() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts {
        join: Script::Broken,
        ..Scripts::default()
    });

    let state = runner
        .start(fx.request("nojoin-1"), StartMode::Blocking)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(state, FlowState::Failed);
    assert_eq!(Calls::get(&fx.calls.join), 1);
    assert_eq!(Calls::get(&fx.calls.artifacts), 0);
}

// =============================================================================
// Store guarantees
// =============================================================================

#[tokio::test]
async fn test_second_snapshot_for_finished_run_is_rejected() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());
    runner
        .start(fx.request("snap-1"), StartMode::Blocking)
        .await
        .unwrap();

    let err = fx
        .db
        .call(|db| {
            db.put_scanner_snapshot(
                "snap-1",
                &ScannerSnapshot::new(json!({"rescanned": true})),
                SnapshotWrite::Insert,
            )
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::SnapshotExists { .. }));
}

// =============================================================================
// API surface
// =============================================================================

#[tokio::test]
async fn test_detached_start_returns_before_completion() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());

    let handle = runner
        .start(fx.request("bg-1"), StartMode::Detached)
        .await
        .unwrap();
    assert_eq!(handle.run_id(), "bg-1");
    assert!(handle.terminal_state().is_none());
    assert_eq!(handle.wait().await.unwrap(), FlowState::Done);
    assert_eq!(runner.status("bg-1").await.unwrap(), FlowState::Done);
}

#[tokio::test]
async fn test_leased_run_is_busy() {
    let fx = Fixture::new();
    fx.seed_branching_run("busy-1");
    fx.db
        .lock_sync()
        .unwrap()
        .acquire_lease("busy-1", "another-orchestrator", Duration::from_secs(60))
        .unwrap();

    let runner = fx.runner(Scripts::default());
    let err = runner.resume("busy-1").await.unwrap_err();
    assert!(matches!(err, FlowError::RunBusy { .. }));
    assert_eq!(runner.status("busy-1").await.unwrap(), FlowState::Branching);
    assert_eq!(fx.calls.branch_total(), 0);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over_on_resume() {
    let fx = Fixture::new();
    fx.seed_branching_run("stale-1");
    fx.db
        .lock_sync()
        .unwrap()
        .acquire_lease("stale-1", "crashed-orchestrator", Duration::ZERO)
        .unwrap();

    let runner = fx.runner(Scripts::default());
    let state = runner.resume("stale-1").await.unwrap().wait().await.unwrap();
    assert_eq!(state, FlowState::Done);
}

#[tokio::test]
async fn test_heartbeat_keeps_lease_through_stage_longer_than_ttl() {
    let fx = Fixture::new();
    let mut config = fast_config();
    config.lease.ttl_seconds = 1;
    let owner = fx.runner_with(
        config.clone(),
        Scripts {
            scan: Script::Slow(Duration::from_millis(1750)),
            ..Scripts::default()
        },
    );
    let rival = fx.runner_with(config, Scripts::default());

    let handle = owner
        .start(fx.request("long-1"), StartMode::Detached)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(
        rival.resume("long-1").await.unwrap_err(),
        FlowError::RunBusy { .. }
    ));

    assert_eq!(handle.wait().await.unwrap(), FlowState::Done);
    assert_eq!(Calls::get(&fx.calls.scan), 1);
    let log = fx.transitions("long-1").await;
    assert_log_follows_table(&log);
    assert!(log.iter().all(|t| t.to_state != FlowState::Failed));
}

#[tokio::test]
async fn test_runner_that_lost_its_lease_stops_without_writing() {
    let fx = Fixture::new();
    let mut config = fast_config();
    config.lease.ttl_seconds = 1;
    let runner = fx.runner_with(
        config,
        Scripts {
            scan: Script::Slow(Duration::from_millis(300)),
            ..Scripts::default()
        },
    );

    let handle = runner
        .start(fx.request("taken-1"), StartMode::Detached)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    fx.set_lease("taken-1", Some("other-orchestrator"), "2999-01-01T00:00:00.000000Z");

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, FlowError::LeaseLost { .. }), "{:?}", err);

    assert_eq!(runner.status("taken-1").await.unwrap(), FlowState::Scanning);
    assert_eq!(fx.transitions("taken-1").await.len(), 1);
    let snapshot = fx
        .db
        .call(|db| db.get_scanner_snapshot("taken-1"))
        .await
        .unwrap();
    assert!(snapshot.is_none());
    let manifest = fx
        .db
        .call(|db| db.get_run_manifest("taken-1"))
        .await
        .unwrap();
    assert!(manifest.is_none());
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());
    assert!(matches!(
        runner.resume("ghost").await.unwrap_err(),
        FlowError::NotFound { .. }
    ));
    assert!(matches!(
        runner.status("ghost").await.unwrap_err(),
        FlowError::NotFound { .. }
    ));
    assert!(matches!(
        runner.result("ghost").await.unwrap_err(),
        FlowError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_invalid_request_creates_no_run() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());

    let missing = AnalyzeRequest::local(Path::new("/definitely/not/here")).with_run_id("bad-1");
    let err = runner.start(missing, StartMode::Blocking).await.unwrap_err();
    assert!(matches!(err, FlowError::Validation(_)));
    assert!(matches!(
        runner.status("bad-1").await.unwrap_err(),
        FlowError::NotFound { .. }
    ));

    let unknown_profile = fx.request("bad-2").with_provider_profile("nope");
    assert!(matches!(
        runner.start(unknown_profile, StartMode::Blocking).await,
        Err(FlowError::Validation(_))
    ));
    assert_eq!(Calls::get(&fx.calls.scan), 0);
}

#[tokio::test]
async fn test_reused_run_id_is_rejected() {
    let fx = Fixture::new();
    let runner = fx.runner(Scripts::default());
    runner
        .start(fx.request("dup-1"), StartMode::Blocking)
        .await
        .unwrap();
    let err = runner
        .start(fx.request("dup-1"), StartMode::Blocking)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(msg) if msg.contains("already in use")));
    assert_eq!(Calls::get(&fx.calls.scan), 1);
}

struct Recorder(Mutex<Vec<TransitionRecord>>);

impl TransitionObserver for Recorder {
    fn on_transition(&self, transition: &TransitionRecord) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(transition.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_observer_sees_every_durable_transition() {
    let fx = Fixture::new();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let runner = fx
        .runner(Scripts::default())
        .with_observer(recorder.clone());

    runner
        .start(fx.request("obs-1"), StartMode::Blocking)
        .await
        .unwrap();

    let mut observed = recorder.0.lock().unwrap().clone();
    // Branch transitions are observed from concurrent tasks.
    observed.sort_by_key(|t| t.seq);
    assert_eq!(observed, fx.transitions("obs-1").await);
}
