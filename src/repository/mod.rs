//! Job repository
//!
//! Durable mapping from job id to [`JobRecord`]. Every operation is atomic per
//! job id, and results are written per number slot so concurrent workers on
//! the same job never overwrite each other.
//!
//! Terminal job states are sticky: once `completed`, `failed` or `cancelled`,
//! `update_state` leaves the record alone.
//!
//! # Usage
//!
//! ```rust,ignore
//! use phonecheck::repository::{JobRepository, SqliteJobRepository};
//!
//! // Production: use SQLite
//! let repo = SqliteJobRepository::new("jobs.db")?;
//!
//! // Testing: use the in-memory map
//! let repo = MemoryJobRepository::new();
//! ```

pub mod sqlite;

pub use sqlite::SqliteJobRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{JobId, JobRecord, JobState, NumberResult, PhoneNumber};

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository for job records
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job
    async fn create(&self, job: &JobRecord) -> Result<()>;

    /// Load a job; [`Error::JobNotFound`] for unknown ids
    async fn get(&self, id: &JobId) -> Result<JobRecord>;

    /// Fill the result slot of `number` and return the updated record
    async fn update_result(
        &self,
        id: &JobId,
        number: &PhoneNumber,
        result: NumberResult,
    ) -> Result<JobRecord>;

    /// Move a job to `state`; returns whether the record changed.
    ///
    /// Ignored when the job is already terminal or the move would go back to `queued`.
    async fn update_state(&self, id: &JobId, state: JobState, error: Option<String>) -> Result<bool>;

    /// Jobs not yet in a terminal state
    async fn list_pending(&self) -> Result<Vec<JobRecord>>;

    /// Delete terminal jobs last updated before `cutoff`; returns how many
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Whether a job in `current` may move to `next`
pub(crate) fn transition_allowed(current: JobState, next: JobState) -> bool {
    !current.is_terminal() && current != next && next != JobState::Queued
}

/// Index of `number` in the job, or an input error
pub(crate) fn slot_of(job: &JobRecord, number: &PhoneNumber) -> Result<usize> {
    job.numbers.iter().position(|n| n == number).ok_or_else(|| {
        Error::invalid_input(format!("number {number} is not part of job {}", job.id))
    })
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory implementation of JobRepository
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of stored jobs
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&job.id) {
            return Err(Error::Storage(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(id.clone()))
    }

    async fn update_result(
        &self,
        id: &JobId,
        number: &PhoneNumber,
        result: NumberResult,
    ) -> Result<JobRecord> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(id).ok_or_else(|| Error::JobNotFound(id.clone()))?;
        let slot = slot_of(job, number)?;
        job.results[slot] = Some(result);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn update_state(&self, id: &JobId, state: JobState, error: Option<String>) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(id).ok_or_else(|| Error::JobNotFound(id.clone()))?;
        if !transition_allowed(job.state, state) {
            return Ok(false);
        }
        job.state = state;
        if error.is_some() {
            job.error = error;
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_pending(&self) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<JobRecord> = jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && j.updated_at < cutoff));
        Ok(before - jobs.len())
    }
}

// ============================================================================
// Tests
// ============================================================================
