use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::{Fingerprint, Parameters};

/// Unique identifier of a simulation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Opaque reference to one in-flight execution of a job.
///
/// Present exactly while the job is `Running`; the dispatcher uses it to
/// revoke the underlying task on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    pub fn new() -> Self {
        TaskHandle(Uuid::new_v4())
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The result bundle produced by one solver run.
///
/// Artifact names (result file, mesh/geometry images, exported models) are
/// owned by the executor's contract; the orchestrator treats them as opaque
/// blobs. The summary always exists, even when artifact rendering failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationResult {
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub summary: BTreeMap<String, f64>,
}

impl SimulationResult {
    pub fn with_summary(summary: BTreeMap<String, f64>) -> Self {
        Self {
            artifacts: BTreeMap::new(),
            summary,
        }
    }
}

/// One request to run a parameterized simulation, and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub parameters: Parameters,
    pub parameters_fingerprint: Fingerprint,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<SimulationResult>,
    pub task_handle: Option<TaskHandle>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
}

impl Job {
    /// Create a fresh pending job. The fingerprint is computed once here
    /// and never recomputed for the same parameter value.
    pub fn new(parameters: Parameters, fingerprint: Fingerprint) -> Self {
        Self {
            id: JobId::new(),
            parameters,
            parameters_fingerprint: fingerprint,
            state: JobState::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            task_handle: None,
            failure_reason: None,
            attempts: 0,
        }
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            completed_at: self.completed_at,
            parameters: self.parameters.clone(),
            result_summary: self.result.as_ref().map(|r| r.summary.clone()),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// What clients see when they query a job. Raw internal errors never
/// appear here, only the short failure reason recorded on the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parameters: Parameters,
    pub result_summary: Option<BTreeMap<String, f64>>,
    pub failure_reason: Option<String>,
}
