// Core data structures for the phonecheck scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::utils::phone;

/// Lookup source enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Kaspersky,
    Truecaller,
    GetContact,
    Tbank,
}

impl Provider {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kaspersky => "kaspersky",
            Self::Truecaller => "truecaller",
            Self::GetContact => "getcontact",
            Self::Tbank => "tbank",
        }
    }

    /// Get all providers
    pub fn all() -> Vec<Self> {
        vec![Self::Kaspersky, Self::Truecaller, Self::GetContact, Self::Tbank]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kaspersky" => Ok(Self::Kaspersky),
            "truecaller" => Ok(Self::Truecaller),
            "getcontact" => Ok(Self::GetContact),
            "tbank" => Ok(Self::Tbank),
            other => Err(Error::invalid_input(format!("unknown provider '{other}'"))),
        }
    }
}

/// Normalized phone number (`+` followed by digits)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalize a raw string, rejecting results that are not international numbers
    pub fn parse(raw: &str) -> Result<Self> {
        phone::normalize_strict(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits without the leading `+`, used for prefix routing
    pub fn digits(&self) -> &str {
        self.0.trim_start_matches('+')
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verdict returned by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckStatus {
    Safe,
    Spam,
    NotInDatabase,
    Unknown,
    Error,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "Safe",
            Self::Spam => "Spam",
            Self::NotInDatabase => "NotInDatabase",
            Self::Unknown => "Unknown",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful answer from a lookup driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupOutcome {
    pub status: CheckStatus,
    pub details: Option<String>,
}

impl LookupOutcome {
    pub fn new(status: CheckStatus) -> Self {
        Self {
            status,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Why a provider did not produce a result for a number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ResourceUnavailable,
    Transient,
    Terminal,
}

/// One recorded provider failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: Provider,
    pub kind: FailureKind,
    pub message: String,
    /// Zero-based cycle in which the failure happened
    pub attempt: u32,
}

/// Final result for one number of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberResult {
    pub number: PhoneNumber,
    pub status: CheckStatus,
    pub details: Option<String>,
    /// Provider that answered; `None` when every candidate failed
    pub source: Option<Provider>,
    pub attempts: u32,
    pub from_cache: bool,
    pub failures: Vec<ProviderFailure>,
    pub finished_at: DateTime<Utc>,
}

impl NumberResult {
    /// Result answered by a live lookup
    pub fn found(
        number: PhoneNumber,
        provider: Provider,
        outcome: LookupOutcome,
        attempts: u32,
        failures: Vec<ProviderFailure>,
    ) -> Self {
        Self {
            number,
            status: outcome.status,
            details: outcome.details,
            source: Some(provider),
            attempts,
            from_cache: false,
            failures,
            finished_at: Utc::now(),
        }
    }

    /// Result served from the cache
    pub fn cached(number: PhoneNumber, provider: Provider, outcome: LookupOutcome) -> Self {
        Self {
            number,
            status: outcome.status,
            details: outcome.details,
            source: Some(provider),
            attempts: 0,
            from_cache: true,
            failures: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Result of a work item that exhausted its providers or retries
    pub fn errored(number: PhoneNumber, attempts: u32, failures: Vec<ProviderFailure>) -> Self {
        let details = failures
            .last()
            .map(|f| format!("{}: {}", f.provider, f.message));
        Self {
            number,
            status: CheckStatus::Error,
            details,
            source: None,
            attempts,
            from_cache: false,
            failures,
            finished_at: Utc::now(),
        }
    }

    /// Whether a provider answered (the work item ended `done`)
    pub fn is_success(&self) -> bool {
        self.source.is_some()
    }
}

/// Opaque unique job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Storage(format!("unknown job state '{other}'"))),
        }
    }
}

/// Caller options for a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub forced_provider: Option<Provider>,
}

fn default_use_cache() -> bool {
    true
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            forced_provider: None,
        }
    }
}

/// Persistent job record
///
/// `results` has one slot per entry of `numbers`, in submission order. A slot
/// is filled exactly once, when its work item reaches `done` or `errored`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub numbers: Vec<PhoneNumber>,
    pub state: JobState,
    pub options: SubmitOptions,
    pub results: Vec<Option<NumberResult>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(numbers: Vec<PhoneNumber>, options: SubmitOptions) -> Self {
        let now = Utc::now();
        let results = vec![None; numbers.len()];
        Self {
            id: JobId::new(),
            numbers,
            state: JobState::Queued,
            options,
            results,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of finished (done or errored) slots
    pub fn finished_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Finished slots over total slots
    pub fn progress(&self) -> f64 {
        if self.numbers.is_empty() {
            return 0.0;
        }
        self.finished_count() as f64 / self.numbers.len() as f64
    }

    pub fn all_finished(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    /// Numbers whose slot is still empty
    pub fn pending_numbers(&self) -> Vec<PhoneNumber> {
        self.numbers
            .iter()
            .zip(&self.results)
            .filter(|(_, r)| r.is_none())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// State a fully finished job settles in.
    ///
    /// `failed` only when no number got an answer from any provider.
    pub fn final_state(&self) -> JobState {
        let any_success = self.results.iter().flatten().any(NumberResult::is_success);
        if any_success {
            JobState::Completed
        } else {
            JobState::Failed
        }
    }
}

/// Caller-facing view of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub progress: f64,
    pub results: Vec<NumberResult>,
    pub error: Option<String>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            progress: job.progress(),
            results: job.results.iter().flatten().cloned().collect(),
            error: job.error.clone(),
        }
    }
}

/// Work item sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Pending,
    Running,
    Done,
    Errored,
    /// Dropped because its job was cancelled
    Abandoned,
}

/// One (job, number) unit of scheduled work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub job_id: JobId,
    pub number: PhoneNumber,
    pub state: WorkItemState,
    /// Completed candidate cycles that ended without an answer
    pub attempt: u32,
    pub use_cache: bool,
    pub forced_provider: Option<Provider>,
    /// Providers that rejected the number terminally
    pub excluded: Vec<Provider>,
    pub failures: Vec<ProviderFailure>,
}

impl WorkItem {
    pub fn new(job_id: JobId, number: PhoneNumber, options: &SubmitOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            job_id,
            number,
            state: WorkItemState::Pending,
            attempt: 0,
            use_cache: options.use_cache,
            forced_provider: options.forced_provider,
            excluded: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Lease holder identity for this item
    pub fn holder_id(&self) -> String {
        format!("{}:{}", self.job_id, self.id)
    }

    pub fn record_failure(&mut self, provider: Provider, kind: FailureKind, message: String) {
        if kind == FailureKind::Terminal && !self.excluded.contains(&provider) {
            self.excluded.push(provider);
        }
        self.failures.push(ProviderFailure {
            provider,
            kind,
            message,
            attempt: self.attempt,
        });
    }
}
