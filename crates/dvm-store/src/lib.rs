// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable job store.
//!
//! A single WAL-journalled sqlite table owns every [`Job`] record. All
//! mutation goes through this API under a single-writer mutex; nothing
//! else in the workspace holds job state in memory. Transitions are
//! written compare-and-swap style so concurrent handlers cannot race a
//! record into an illegal state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use dvm_core::{unix_now, Job, JobInput, JobState, JobStateParseError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying sqlite failure.
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),

    /// The stored input snapshot could not be (de)serialized.
    #[error("input snapshot error")]
    Snapshot(#[from] serde_json::Error),

    /// A stored state string was not recognised.
    #[error(transparent)]
    State(#[from] JobStateParseError),

    /// The requested edge is not in the allowed transition graph.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// State the caller claimed the job was in.
        from: JobState,
        /// State the caller asked for.
        to: JobState,
    },
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// Columns that may be written together with a state change.
///
/// This is the whitelist of `spec`-visible mutable columns; anything else
/// is unrepresentable here, so a stray column name cannot reach SQL.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    /// BOLT-11 invoice string.
    pub bolt11: Option<String>,
    /// Deterministic invoice lookup hash.
    pub invoice_hash: Option<String>,
    /// Price in millisatoshis.
    pub amount_msats: Option<u64>,
    /// Execution output.
    pub result: Option<String>,
    /// Failure summary.
    pub error: Option<String>,
    /// Replacement input snapshot.
    pub input: Option<JobInput>,
}

impl JobPatch {
    /// Patch binding an invoice to a job.
    pub fn invoice(bolt11: String, invoice_hash: String, amount_msats: u64) -> Self {
        Self {
            bolt11: Some(bolt11),
            invoice_hash: Some(invoice_hash),
            amount_msats: Some(amount_msats),
            ..Default::default()
        }
    }

    /// Patch recording a successful result.
    pub fn result(result: String) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    /// Patch recording a failure summary.
    pub fn error(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Outcome of [`JobStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new row was inserted.
    Created,
    /// A row with this event id already existed; nothing was written.
    Duplicate,
}

impl CreateOutcome {
    /// Convenience predicate for replay handling.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    event_id      TEXT PRIMARY KEY,
    customer      TEXT NOT NULL,
    kind          INTEGER NOT NULL,
    state         TEXT NOT NULL DEFAULT 'received',
    input         TEXT,
    bolt11        TEXT,
    invoice_hash  TEXT,
    amount_msats  INTEGER,
    result        TEXT,
    error         TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_invoice ON jobs(invoice_hash);
";

/// Sqlite-backed job table with single-writer discipline.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database. Intended for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert-if-absent. A duplicate event id is not an error; the outcome
    /// distinguishes it so callers can drop replays silently.
    pub fn create(
        &self,
        event_id: &str,
        customer: &str,
        kind: u16,
        input: &JobInput,
    ) -> Result<CreateOutcome, StoreError> {
        let now = unix_now();
        let snapshot = serde_json::to_string(input)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs
               (event_id, customer, kind, state, input, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id,
                customer,
                kind,
                JobState::Received.as_str(),
                snapshot,
                now,
                now
            ],
        )?;
        Ok(if inserted == 1 {
            CreateOutcome::Created
        } else {
            CreateOutcome::Duplicate
        })
    }

    /// Single atomic write of `state`, `updated_at`, and the patch columns.
    pub fn update(
        &self,
        event_id: &str,
        state: JobState,
        patch: JobPatch,
    ) -> Result<(), StoreError> {
        let (sql, values) = build_update(event_id, state, &patch, None)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    /// Compare-and-swap transition: writes only when the row is still in
    /// `from`, and only along an allowed edge. Returns whether the write
    /// landed — `false` means another handler got there first (or the job
    /// was already terminal), which is the idempotence gate for duplicate
    /// receipts.
    pub fn transition(
        &self,
        event_id: &str,
        from: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        let (sql, values) = build_update(event_id, to, &patch, Some(from))?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        debug!(target: "dvm.store", %event_id, %from, %to, changed, "transition");
        Ok(changed == 1)
    }

    /// Point lookup by event id.
    pub fn get(&self, event_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT * FROM jobs WHERE event_id = ?1",
            params![event_id],
            row_to_job,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Point lookup by invoice hash (receipt-to-job resolution).
    pub fn get_by_invoice(&self, invoice_hash: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT * FROM jobs WHERE invoice_hash = ?1",
            params![invoice_hash],
            row_to_job,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Scan by state. Used by restart reconciliation and diagnostics.
    pub fn jobs_in_state(&self, state: JobState) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE state = ?1")?;
        let rows = stmt.query_map(params![state.as_str()], row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Expire every job that has been waiting for payment longer than
    /// `timeout_secs`. Returns the number of rows transitioned.
    pub fn expire_stale(&self, timeout_secs: u64) -> Result<usize, StoreError> {
        let now = unix_now();
        let cutoff = now - timeout_secs as i64;
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2
               WHERE state = ?3 AND updated_at < ?4",
            params![
                JobState::Expired.as_str(),
                now,
                JobState::WaitingPayment.as_str(),
                cutoff
            ],
        )?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// SQL assembly / row mapping
// ---------------------------------------------------------------------------

fn build_update(
    event_id: &str,
    state: JobState,
    patch: &JobPatch,
    guard: Option<JobState>,
) -> Result<(String, Vec<Value>), StoreError> {
    let mut sql = String::from("UPDATE jobs SET state = ?, updated_at = ?");
    let mut values: Vec<Value> = vec![
        Value::Text(state.as_str().to_string()),
        Value::Integer(unix_now()),
    ];

    if let Some(bolt11) = &patch.bolt11 {
        sql.push_str(", bolt11 = ?");
        values.push(Value::Text(bolt11.clone()));
    }
    if let Some(invoice_hash) = &patch.invoice_hash {
        sql.push_str(", invoice_hash = ?");
        values.push(Value::Text(invoice_hash.clone()));
    }
    if let Some(amount) = patch.amount_msats {
        sql.push_str(", amount_msats = ?");
        values.push(Value::Integer(amount as i64));
    }
    if let Some(result) = &patch.result {
        sql.push_str(", result = ?");
        values.push(Value::Text(result.clone()));
    }
    if let Some(error) = &patch.error {
        sql.push_str(", error = ?");
        values.push(Value::Text(error.clone()));
    }
    if let Some(input) = &patch.input {
        sql.push_str(", input = ?");
        values.push(Value::Text(serde_json::to_string(input)?));
    }

    sql.push_str(" WHERE event_id = ?");
    values.push(Value::Text(event_id.to_string()));

    if let Some(from) = guard {
        sql.push_str(" AND state = ?");
        values.push(Value::Text(from.as_str().to_string()));
    }

    Ok((sql, values))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state_str: String = row.get("state")?;
    let state = JobState::from_str(&state_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;

    let input_json: Option<String> = row.get("input")?;
    let input = match input_json {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        None => None,
    };

    let amount: Option<i64> = row.get("amount_msats")?;

    Ok(Job {
        event_id: row.get("event_id")?,
        customer: row.get("customer")?,
        kind: row.get::<_, i64>("kind")? as u16,
        state,
        input,
        bolt11: row.get("bolt11")?,
        invoice_hash: row.get("invoice_hash")?,
        amount_msats: amount.map(|a| a as u64),
        result: row.get("result")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
