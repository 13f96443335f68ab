//! SQLite implementation of JobRepository
//!
//! Jobs live in `jobs`; each filled result slot is one row of `job_results`
//! keyed by `(job_id, position)`, so a result write touches only its own row.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{transition_allowed, JobRepository};
use crate::error::{Error, Result};
use crate::models::{JobId, JobRecord, JobState, NumberResult, PhoneNumber};

/// SQLite job store
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteJobRepository {
    conn: Mutex<Connection>,
}

impl SqliteJobRepository {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite job repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create database schema
    fn create_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    numbers TEXT NOT NULL,
                    state TEXT NOT NULL,
                    options TEXT NOT NULL,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_state
                    ON jobs(state);

                CREATE TABLE IF NOT EXISTS job_results (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    result TEXT NOT NULL,
                    PRIMARY KEY (job_id, position)
                );
                "#,
        )?;
        Ok(())
    }
}

struct JobRow {
    id: String,
    numbers: String,
    state: String,
    options: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

const SELECT_JOB: &str =
    "SELECT id, numbers, state, options, error, created_at, updated_at FROM jobs";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        numbers: row.get(1)?,
        state: row.get(2)?,
        options: row.get(3)?,
        error: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Fixed-width UTC timestamps so text comparison orders them correctly
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp '{value}': {e}")))
}

/// Assemble a record from its row plus its result rows
fn hydrate(conn: &Connection, row: JobRow) -> Result<JobRecord> {
    let numbers: Vec<PhoneNumber> = serde_json::from_str(&row.numbers)?;
    let mut results: Vec<Option<NumberResult>> = vec![None; numbers.len()];

    let mut stmt = conn.prepare("SELECT position, result FROM job_results WHERE job_id = ?1")?;
    let rows = stmt.query_map(params![row.id], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
    })?;
    for entry in rows {
        let (position, json) = entry?;
        let slot = results
            .get_mut(position as usize)
            .ok_or_else(|| Error::Storage(format!("result position {position} out of range")))?;
        *slot = Some(serde_json::from_str(&json)?);
    }

    Ok(JobRecord {
        id: JobId::from(row.id),
        numbers,
        state: row.state.parse()?,
        options: serde_json::from_str(&row.options)?,
        results,
        error: row.error,
        created_at: parse_time(&row.created_at)?,
        updated_at: parse_time(&row.updated_at)?,
    })
}

fn load(conn: &Connection, id: &JobId) -> Result<JobRecord> {
    let row = conn
        .query_row(&format!("{SELECT_JOB} WHERE id = ?1"), params![id.as_str()], read_row)
        .optional()?
        .ok_or_else(|| Error::JobNotFound(id.clone()))?;
    hydrate(conn, row)
}

fn current_state(conn: &Connection, id: &JobId) -> Result<JobState> {
    let state: String = conn
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id.as_str()], |r| r.get(0))
        .optional()?
        .ok_or_else(|| Error::JobNotFound(id.clone()))?;
    state.parse()
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create(&self, job: &JobRecord) -> Result<()> {
        let conn = self.lock();
        let inserted = conn.execute(
            r#"
                INSERT OR IGNORE INTO jobs (id, numbers, state, options, error, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            params![
                job.id.as_str(),
                serde_json::to_string(&job.numbers)?,
                job.state.as_str(),
                serde_json::to_string(&job.options)?,
                job.error,
                timestamp(job.created_at),
                timestamp(job.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(Error::Storage(format!("job {} already exists", job.id)));
        }

        for (position, result) in job.results.iter().enumerate() {
            if let Some(result) = result {
                conn.execute(
                    "INSERT INTO job_results (job_id, position, result) VALUES (?1, ?2, ?3)",
                    params![job.id.as_str(), position as i64, serde_json::to_string(result)?],
                )?;
            }
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        load(&self.lock(), id)
    }

    async fn update_result(
        &self,
        id: &JobId,
        number: &PhoneNumber,
        result: NumberResult,
    ) -> Result<JobRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let numbers: String = tx
            .query_row("SELECT numbers FROM jobs WHERE id = ?1", params![id.as_str()], |r| r.get(0))
            .optional()?
            .ok_or_else(|| Error::JobNotFound(id.clone()))?;
        let numbers: Vec<PhoneNumber> = serde_json::from_str(&numbers)?;
        let position = numbers.iter().position(|n| n == number).ok_or_else(|| {
            Error::invalid_input(format!("number {number} is not part of job {id}"))
        })?;

        tx.execute(
            "INSERT OR REPLACE INTO job_results (job_id, position, result) VALUES (?1, ?2, ?3)",
            params![id.as_str(), position as i64, serde_json::to_string(&result)?],
        )?;
        tx.execute(
            "UPDATE jobs SET updated_at = ?2 WHERE id = ?1",
            params![id.as_str(), timestamp(Utc::now())],
        )?;
        let record = load(&tx, id)?;
        tx.commit()?;
        Ok(record)
    }

    async fn update_state(&self, id: &JobId, state: JobState, error: Option<String>) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current = current_state(&tx, id)?;
        if !transition_allowed(current, state) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE jobs SET state = ?2, error = COALESCE(?3, error), updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), state.as_str(), error, timestamp(Utc::now())],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn list_pending(&self) -> Result<Vec<JobRecord>> {
        let conn = self.lock();
        let rows: Vec<JobRow> = {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_JOB} WHERE state IN ('queued', 'in_progress') ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], read_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        rows.into_iter().map(|row| hydrate(&conn, row)).collect()
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let purged = conn.execute(
            "DELETE FROM jobs WHERE state IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
            params![timestamp(cutoff)],
        )?;
        if purged > 0 {
            tracing::info!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }
}
