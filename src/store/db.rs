use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde_json::Value;

use super::models::*;
use crate::errors::{DbContext, StoreError};
use crate::flow::{FlowNode, FlowState, state};
use crate::redaction::redact_text;
use crate::stage::{BranchKind, BranchOutcome, BranchStatus, ScannerSnapshot};

/// Async-safe handle to the flow database.
///
/// Wraps `FlowDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Every write for every run goes
/// through the one mutex, so writes to the same run are serialized and no
/// caller can hold the lock across adapter work.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FlowDb>>,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").finish_non_exhaustive()
    }
}

impl DbHandle {
    pub fn new(db: FlowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&FlowDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::TaskPanicked(e.to_string()))?
    }

    /// Acquire the database mutex synchronously. For setup code and tests;
    /// never call this from an async hot path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FlowDb>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

pub struct FlowDb {
    pub(crate) conn: Connection,
}

/// Current time at the precision timestamps are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn now_ts() -> String {
    ts(&now())
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(run_id: &str, what: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            run_id: run_id.to_string(),
            what,
            message: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn parse_field<T: FromStr<Err = String>>(
    run_id: &str,
    what: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    T::from_str(raw).map_err(|message| StoreError::Corrupt {
        run_id: run_id.to_string(),
        what,
        message,
    })
}

fn parse_json(run_id: &str, what: &'static str, raw: &str) -> Result<Value, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        run_id: run_id.to_string(),
        what,
        message: e.to_string(),
    })
}

impl FlowDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).db_context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .db_context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .db_context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .db_context("Failed to enable foreign keys")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    run_id TEXT PRIMARY KEY,
                    schema_version TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    resolved_path TEXT NOT NULL,
                    provider_profile TEXT NOT NULL,
                    target_json TEXT NOT NULL,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS flow_transitions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    node_id TEXT NOT NULL,
                    from_state TEXT NOT NULL,
                    to_state TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    attempts INTEGER
                );

                CREATE TABLE IF NOT EXISTS scanner_snapshots (
                    run_id TEXT PRIMARY KEY REFERENCES runs(run_id),
                    payload_json TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS branch_outcomes (
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    branch TEXT NOT NULL,
                    status TEXT NOT NULL,
                    payload_json TEXT,
                    reason TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, branch)
                );

                CREATE TABLE IF NOT EXISTS stage_outputs (
                    run_id TEXT NOT NULL REFERENCES runs(run_id),
                    node_id TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, node_id)
                );

                CREATE TABLE IF NOT EXISTS run_manifests (
                    run_id TEXT PRIMARY KEY REFERENCES runs(run_id),
                    created_at TEXT NOT NULL,
                    payload_json TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_leases (
                    run_id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_flow_transitions_run ON flow_transitions(run_id, seq);
                ",
            )
            .db_context("Failed to create tables")
    }

    fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .db_context("Failed to begin transaction")
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, run: &NewRun) -> Result<RunRecord, StoreError> {
        let run_id = run.run_id();
        let tx = self.begin()?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM runs WHERE run_id = ?1)",
                params![run_id],
                |row| row.get(0),
            )
            .db_context("Failed to check for existing run")?;
        if exists {
            return Err(StoreError::RunExists {
                run_id: run_id.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO runs (run_id, schema_version, repo_name, resolved_path, provider_profile,
                               target_json, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                run.schema_version,
                run.target.repo_name,
                run.target.resolved_path.to_string_lossy(),
                run.provider_profile,
                serde_json::to_string(&run.target)?,
                FlowState::Validated.as_str(),
                now_ts()
            ],
        )
        .db_context("Failed to insert run")?;
        tx.commit().db_context("Failed to commit run")?;
        self.get_run(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, schema_version, repo_name, resolved_path, provider_profile,
                        target_json, status, started_at, finished_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        schema_version: row.get(1)?,
                        repo_name: row.get(2)?,
                        resolved_path: row.get(3)?,
                        provider_profile: row.get(4)?,
                        target_json: row.get(5)?,
                        status: row.get(6)?,
                        started_at: row.get(7)?,
                        finished_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .db_context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// Append a transition and move the run's status, atomically.
    ///
    /// Rejects edges missing from the transition table, edges whose `from`
    /// state is not the run's current status, and fenced transitions whose
    /// owner no longer holds the run's lease.
    pub fn append_transition(
        &self,
        run_id: &str,
        transition: &NewTransition,
    ) -> Result<TransitionRecord, StoreError> {
        let tx = self.begin()?;
        let record = append_transition_in(&tx, run_id, transition)?;
        tx.commit().db_context("Failed to commit transition")?;
        Ok(record)
    }

    /// All transitions of a run, ordered by `seq`.
    ///
    /// `seq` is the total order of the log. Timestamps are stored at
    /// microsecond precision and can tie between consecutive transitions.
    pub fn list_transitions(&self, run_id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, run_id, node_id, from_state, to_state, timestamp, reason, attempts
                 FROM flow_transitions WHERE run_id = ?1 ORDER BY seq ASC",
            )
            .db_context("Failed to prepare list_transitions")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(TransitionRow {
                    seq: row.get(0)?,
                    run_id: row.get(1)?,
                    node_id: row.get(2)?,
                    from_state: row.get(3)?,
                    to_state: row.get(4)?,
                    timestamp: row.get(5)?,
                    reason: row.get(6)?,
                    attempts: row.get(7)?,
                })
            })
            .db_context("Failed to query transitions")?;
        let mut transitions = Vec::new();
        for row in rows {
            let row = row.db_context("Failed to read transition row")?;
            transitions.push(row.into_transition()?);
        }
        Ok(transitions)
    }

    // ── Scanner snapshots ─────────────────────────────────────────────

    pub fn put_scanner_snapshot(
        &self,
        run_id: &str,
        snapshot: &ScannerSnapshot,
        mode: SnapshotWrite,
    ) -> Result<(), StoreError> {
        let tx = self.begin()?;
        put_snapshot_in(&tx, run_id, snapshot, mode)?;
        tx.commit().db_context("Failed to commit scanner snapshot")
    }

    pub fn get_scanner_snapshot(&self, run_id: &str) -> Result<Option<ScannerSnapshot>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM scanner_snapshots WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .db_context("Failed to query scanner snapshot")?;
        raw.map(|raw| parse_json(run_id, "scanner snapshot", &raw).map(ScannerSnapshot::new))
            .transpose()
    }

    /// Store the snapshot and its completion transition in one transaction.
    pub fn commit_scan(
        &self,
        run_id: &str,
        snapshot: &ScannerSnapshot,
        transition: &NewTransition,
    ) -> Result<TransitionRecord, StoreError> {
        let tx = self.begin()?;
        let record = append_transition_in(&tx, run_id, transition)?;
        put_snapshot_in(&tx, run_id, snapshot, SnapshotWrite::Insert)?;
        tx.commit().db_context("Failed to commit scan stage")?;
        Ok(record)
    }

    // ── Branch outcomes ───────────────────────────────────────────────

    /// Insert or replace the outcome for `(run_id, branch)`.
    pub fn put_branch_outcome(&self, run_id: &str, record: &BranchRecord) -> Result<(), StoreError> {
        let tx = self.begin()?;
        put_branch_in(&tx, run_id, record)?;
        tx.commit().db_context("Failed to commit branch outcome")
    }

    pub fn get_branch_outcomes(&self, run_id: &str) -> Result<Vec<BranchRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT branch, status, payload_json, reason, attempts, recorded_at
                 FROM branch_outcomes WHERE run_id = ?1 ORDER BY branch ASC",
            )
            .db_context("Failed to prepare get_branch_outcomes")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(BranchRow {
                    branch: row.get(0)?,
                    status: row.get(1)?,
                    payload_json: row.get(2)?,
                    reason: row.get(3)?,
                    attempts: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })
            .db_context("Failed to query branch outcomes")?;
        let mut records = Vec::new();
        for row in rows {
            let row = row.db_context("Failed to read branch outcome row")?;
            records.push(row.into_record(run_id)?);
        }
        Ok(records)
    }

    /// Store a branch outcome and its `branch-resolved` transition together.
    pub fn commit_branch(
        &self,
        run_id: &str,
        record: &BranchRecord,
        transition: &NewTransition,
    ) -> Result<TransitionRecord, StoreError> {
        let tx = self.begin()?;
        let transition = append_transition_in(&tx, run_id, transition)?;
        put_branch_in(&tx, run_id, record)?;
        tx.commit().db_context("Failed to commit branch stage")?;
        Ok(transition)
    }

    // ── Stage outputs (synthesis, artifacts) ──────────────────────────

    pub fn put_stage_output(
        &self,
        run_id: &str,
        node: FlowNode,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let tx = self.begin()?;
        put_stage_output_in(&tx, run_id, node, payload)?;
        tx.commit().db_context("Failed to commit stage output")
    }

    pub fn get_stage_output(&self, run_id: &str, node: FlowNode) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM stage_outputs WHERE run_id = ?1 AND node_id = ?2",
                params![run_id, node.as_str()],
                |row| row.get(0),
            )
            .optional()
            .db_context("Failed to query stage output")?;
        raw.map(|raw| parse_json(run_id, "stage output", &raw))
            .transpose()
    }

    /// Store a stage's output and its completion transition together.
    pub fn commit_stage_output(
        &self,
        run_id: &str,
        node: FlowNode,
        payload: &Value,
        transition: &NewTransition,
    ) -> Result<TransitionRecord, StoreError> {
        let tx = self.begin()?;
        let record = append_transition_in(&tx, run_id, transition)?;
        put_stage_output_in(&tx, run_id, node, payload)?;
        tx.commit().db_context("Failed to commit stage output")?;
        Ok(record)
    }

    // ── Run manifests ─────────────────────────────────────────────────

    /// Write the manifest once; a second write is rejected.
    pub fn put_run_manifest(&self, run_id: &str, payload: &Value) -> Result<ManifestRecord, StoreError> {
        let tx = self.begin()?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM run_manifests WHERE run_id = ?1)",
                params![run_id],
                |row| row.get(0),
            )
            .db_context("Failed to check for existing manifest")?;
        if exists {
            return Err(StoreError::ManifestExists {
                run_id: run_id.to_string(),
            });
        }
        ensure_run_in(&tx, run_id)?;
        let created_at = now();
        tx.execute(
            "INSERT INTO run_manifests (run_id, created_at, payload_json) VALUES (?1, ?2, ?3)",
            params![run_id, ts(&created_at), serde_json::to_string(payload)?],
        )
        .db_context("Failed to insert run manifest")?;
        tx.commit().db_context("Failed to commit run manifest")?;
        Ok(ManifestRecord {
            run_id: run_id.to_string(),
            created_at,
            payload: payload.clone(),
        })
    }

    pub fn get_run_manifest(&self, run_id: &str) -> Result<Option<ManifestRecord>, StoreError> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT created_at, payload_json FROM run_manifests WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .db_context("Failed to query run manifest")?;
        row.map(|(created_at, payload)| {
            Ok(ManifestRecord {
                run_id: run_id.to_string(),
                created_at: parse_ts(run_id, "manifest timestamp", &created_at)?,
                payload: parse_json(run_id, "manifest payload", &payload)?,
            })
        })
        .transpose()
    }

    // ── Leases ────────────────────────────────────────────────────────

    /// Claim (or renew) exclusive control of a run.
    ///
    /// Fails with `LeaseHeld` while another owner's lease is unexpired. An
    /// expired lease is taken over; that is how a crashed orchestrator's run
    /// gets resumed.
    pub fn acquire_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<RunLease, StoreError> {
        let tx = self.begin()?;
        let now = now();
        let held: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM run_leases WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .db_context("Failed to query run lease")?;
        if let Some((held_by, expires_raw)) = held
            && held_by != owner
        {
            let expires_at = parse_ts(run_id, "lease expiry", &expires_raw)?;
            if expires_at > now {
                return Err(StoreError::LeaseHeld {
                    run_id: run_id.to_string(),
                    owner: held_by,
                    expires_at: expires_raw,
                });
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        tx.execute(
            "INSERT INTO run_leases (run_id, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at",
            params![run_id, owner, ts(&expires_at)],
        )
        .db_context("Failed to write run lease")?;
        tx.commit().db_context("Failed to commit run lease")?;
        Ok(RunLease {
            run_id: run_id.to_string(),
            owner: owner.to_string(),
            expires_at,
        })
    }

    /// Extend a lease `owner` still holds.
    ///
    /// Unlike `acquire_lease` this never creates or takes over a lease: once
    /// the row was released or handed to another owner the renewal fails
    /// with `LeaseLost`.
    pub fn renew_lease(&self, run_id: &str, owner: &str, ttl: Duration) -> Result<RunLease, StoreError> {
        let tx = self.begin()?;
        check_lease_in(&tx, run_id, owner)?;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        tx.execute(
            "UPDATE run_leases SET expires_at = ?1 WHERE run_id = ?2 AND owner = ?3",
            params![ts(&expires_at), run_id, owner],
        )
        .db_context("Failed to renew run lease")?;
        tx.commit().db_context("Failed to commit lease renewal")?;
        Ok(RunLease {
            run_id: run_id.to_string(),
            owner: owner.to_string(),
            expires_at,
        })
    }

    /// Drop a lease held by `owner`. Releasing someone else's lease is a no-op.
    pub fn release_lease(&self, run_id: &str, owner: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM run_leases WHERE run_id = ?1 AND owner = ?2",
                params![run_id, owner],
            )
            .db_context("Failed to release run lease")?;
        Ok(deleted > 0)
    }
}

// ── Transaction-scoped helpers ────────────────────────────────────────

fn current_status_in(conn: &Connection, run_id: &str) -> Result<FlowState, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .db_context("Failed to query run status")?;
    match raw {
        Some(raw) => parse_field(run_id, "run status", &raw),
        None => Err(StoreError::RunNotFound {
            run_id: run_id.to_string(),
        }),
    }
}

fn check_lease_in(conn: &Connection, run_id: &str, owner: &str) -> Result<(), StoreError> {
    let held: Option<(String, String)> = conn
        .query_row(
            "SELECT owner, expires_at FROM run_leases WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .db_context("Failed to query run lease")?;
    let live = match held {
        Some((held_by, expires_raw)) if held_by == owner => {
            parse_ts(run_id, "lease expiry", &expires_raw)? > now()
        }
        _ => false,
    };
    if live {
        Ok(())
    } else {
        Err(StoreError::LeaseLost {
            run_id: run_id.to_string(),
            owner: owner.to_string(),
        })
    }
}

fn ensure_run_in(conn: &Connection, run_id: &str) -> Result<(), StoreError> {
    current_status_in(conn, run_id).map(|_| ())
}

fn append_transition_in(
    conn: &Connection,
    run_id: &str,
    transition: &NewTransition,
) -> Result<TransitionRecord, StoreError> {
    if let Some(owner) = &transition.lease_owner {
        check_lease_in(conn, run_id, owner)?;
    }
    if !state::is_valid_edge(transition.from, transition.to) {
        return Err(StoreError::InvalidTransition {
            run_id: run_id.to_string(),
            from: transition.from,
            to: transition.to,
        });
    }
    let actual = current_status_in(conn, run_id)?;
    if actual != transition.from {
        return Err(StoreError::StatusMismatch {
            run_id: run_id.to_string(),
            expected: transition.from,
            actual,
        });
    }

    let reason = redact_text(&transition.reason);
    let timestamp = now();
    conn.execute(
        "INSERT INTO flow_transitions (run_id, node_id, from_state, to_state, timestamp, reason, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            transition.node.as_str(),
            transition.from.as_str(),
            transition.to.as_str(),
            ts(&timestamp),
            reason,
            transition.attempts
        ],
    )
    .db_context("Failed to insert transition")?;
    let seq = conn.last_insert_rowid();

    if transition.to.is_terminal() {
        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE run_id = ?3",
            params![transition.to.as_str(), ts(&timestamp), run_id],
        )
    } else {
        conn.execute(
            "UPDATE runs SET status = ?1 WHERE run_id = ?2",
            params![transition.to.as_str(), run_id],
        )
    }
    .db_context("Failed to update run status")?;

    Ok(TransitionRecord {
        seq,
        run_id: run_id.to_string(),
        node: transition.node,
        from_state: transition.from,
        to_state: transition.to,
        timestamp,
        reason,
        attempts: transition.attempts,
    })
}

fn put_snapshot_in(
    conn: &Connection,
    run_id: &str,
    snapshot: &ScannerSnapshot,
    mode: SnapshotWrite,
) -> Result<(), StoreError> {
    ensure_run_in(conn, run_id)?;
    let payload = serde_json::to_string(&snapshot.payload)?;
    match mode {
        SnapshotWrite::Insert => {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM scanner_snapshots WHERE run_id = ?1)",
                    params![run_id],
                    |row| row.get(0),
                )
                .db_context("Failed to check for existing snapshot")?;
            if exists {
                return Err(StoreError::SnapshotExists {
                    run_id: run_id.to_string(),
                });
            }
            conn.execute(
                "INSERT INTO scanner_snapshots (run_id, payload_json) VALUES (?1, ?2)",
                params![run_id, payload],
            )
        }
        SnapshotWrite::Overwrite => conn.execute(
            "INSERT INTO scanner_snapshots (run_id, payload_json) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET payload_json = excluded.payload_json",
            params![run_id, payload],
        ),
    }
    .db_context("Failed to write scanner snapshot")?;
    Ok(())
}

fn put_branch_in(conn: &Connection, run_id: &str, record: &BranchRecord) -> Result<(), StoreError> {
    ensure_run_in(conn, run_id)?;
    let payload = record
        .outcome
        .payload()
        .map(serde_json::to_string)
        .transpose()?;
    let reason = record.outcome.reason().map(redact_text);
    conn.execute(
        "INSERT INTO branch_outcomes (run_id, branch, status, payload_json, reason, attempts, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(run_id, branch) DO UPDATE SET
            status = excluded.status,
            payload_json = excluded.payload_json,
            reason = excluded.reason,
            attempts = excluded.attempts,
            recorded_at = excluded.recorded_at",
        params![
            run_id,
            record.branch.as_str(),
            record.outcome.status().as_str(),
            payload,
            reason,
            record.attempts,
            ts(&record.recorded_at)
        ],
    )
    .db_context("Failed to upsert branch outcome")?;
    Ok(())
}

fn put_stage_output_in(
    conn: &Connection,
    run_id: &str,
    node: FlowNode,
    payload: &Value,
) -> Result<(), StoreError> {
    ensure_run_in(conn, run_id)?;
    conn.execute(
        "INSERT INTO stage_outputs (run_id, node_id, payload_json, recorded_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(run_id, node_id) DO UPDATE SET
            payload_json = excluded.payload_json,
            recorded_at = excluded.recorded_at",
        params![run_id, node.as_str(), serde_json::to_string(payload)?, now_ts()],
    )
    .db_context("Failed to upsert stage output")?;
    Ok(())
}

// ── Row conversion ────────────────────────────────────────────────────

/// Intermediate row struct for reading runs before parsing status and
/// timestamps into typed values.
struct RunRow {
    run_id: String,
    schema_version: String,
    repo_name: String,
    resolved_path: String,
    provider_profile: String,
    target_json: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<RunRecord, StoreError> {
        let status = parse_field(&self.run_id, "run status", &self.status)?;
        let target = serde_json::from_str(&self.target_json).map_err(|e| StoreError::Corrupt {
            run_id: self.run_id.clone(),
            what: "run target",
            message: e.to_string(),
        })?;
        let started_at = parse_ts(&self.run_id, "run start time", &self.started_at)?;
        let finished_at = self
            .finished_at
            .as_deref()
            .map(|raw| parse_ts(&self.run_id, "run finish time", raw))
            .transpose()?;
        Ok(RunRecord {
            run_id: self.run_id,
            schema_version: self.schema_version,
            repo_name: self.repo_name,
            resolved_path: self.resolved_path,
            provider_profile: self.provider_profile,
            target,
            status,
            started_at,
            finished_at,
        })
    }
}

struct TransitionRow {
    seq: i64,
    run_id: String,
    node_id: String,
    from_state: String,
    to_state: String,
    timestamp: String,
    reason: String,
    attempts: Option<u32>,
}

impl TransitionRow {
    fn into_transition(self) -> Result<TransitionRecord, StoreError> {
        Ok(TransitionRecord {
            seq: self.seq,
            node: parse_field(&self.run_id, "transition node", &self.node_id)?,
            from_state: parse_field(&self.run_id, "transition state", &self.from_state)?,
            to_state: parse_field(&self.run_id, "transition state", &self.to_state)?,
            timestamp: parse_ts(&self.run_id, "transition timestamp", &self.timestamp)?,
            reason: self.reason,
            attempts: self.attempts,
            run_id: self.run_id,
        })
    }
}

struct BranchRow {
    branch: String,
    status: String,
    payload_json: Option<String>,
    reason: Option<String>,
    attempts: u32,
    recorded_at: String,
}

impl BranchRow {
    fn into_record(self, run_id: &str) -> Result<BranchRecord, StoreError> {
        let branch: BranchKind = parse_field(run_id, "branch id", &self.branch)?;
        let status: BranchStatus = parse_field(run_id, "branch status", &self.status)?;
        let payload = self
            .payload_json
            .as_deref()
            .map(|raw| parse_json(run_id, "branch payload", raw))
            .transpose()?;
        let missing = |field: &str| StoreError::Corrupt {
            run_id: run_id.to_string(),
            what: "branch outcome",
            message: format!("{} outcome for {} has no {}", status, branch, field),
        };
        let outcome = match status {
            BranchStatus::Succeeded => BranchOutcome::Succeeded {
                payload: payload.ok_or_else(|| missing("payload"))?,
            },
            BranchStatus::Degraded => BranchOutcome::Degraded {
                payload: payload.ok_or_else(|| missing("payload"))?,
                reason: self.reason.ok_or_else(|| missing("reason"))?,
            },
            BranchStatus::Failed => BranchOutcome::Failed {
                reason: self.reason.ok_or_else(|| missing("reason"))?,
            },
        };
        Ok(BranchRecord {
            branch,
            outcome,
            attempts: self.attempts,
            recorded_at: parse_ts(run_id, "branch timestamp", &self.recorded_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
