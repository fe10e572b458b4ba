use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, SimforgeError};
use crate::job::{Job, JobId, JobState};

/// Authoritative record of job identity, parameters, and lifecycle state.
///
/// The orchestrator treats the store as the single source of truth: a state
/// transition has not happened until the store has persisted it. Backends
/// other than the in-memory one (a relational database, typically) implement
/// this same contract.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Apply `mutate` to the stored job under the store's own lock, so a
    /// single read-modify-write never interleaves with another writer.
    async fn update(
        &self,
        id: JobId,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Job) + Send>,
    ) -> Result<Job>;

    async fn delete(&self, id: JobId) -> Result<()>;

    async fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>>;
}

/// In-memory store backed by a `RwLock<HashMap>`, suitable for tests and
/// single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        self.jobs.write().await.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SimforgeError::JobNotFound(id))
    }

    async fn update(
        &self,
        id: JobId,
        mutate: Box<dyn for<'a> FnOnce(&'a mut Job) + Send>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SimforgeError::JobNotFound(id))?;
        mutate(job);
        Ok(job.clone())
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(SimforgeError::JobNotFound(id))
    }

    async fn list(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| filter.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }
}
