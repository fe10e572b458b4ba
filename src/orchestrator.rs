use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::dispatcher::{Dispatcher, JobRunner, RunRequest};
use crate::error::{Result, SimforgeError};
use crate::executor::{ExecutionContext, ExecutionError, Executor};
use crate::job::{Job, JobId, JobState, JobStatusView, TaskHandle};
use crate::params::Parameters;
use crate::store::JobStore;

/// The job lifecycle state machine.
///
/// Admits jobs, consults the result cache before dispatching to the
/// executor, applies retry policy on transient failures, and resolves
/// cancellation races. State transitions for a given job are serialized
/// through a per-job lock; the executor call itself runs outside it so a
/// long solve never blocks `cancel` or `status`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    cache: Arc<dyn ResultCache>,
    executor: Arc<dyn Executor>,
    dispatcher: Arc<Dispatcher>,
    locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn ResultCache>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(
            config.queue_depth,
            config.worker_pool_size,
        ));
        Arc::new(Self {
            config,
            store,
            cache,
            executor,
            dispatcher,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the dispatch loop. Runs until the shutdown token fires.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        let dispatcher = self.dispatcher.clone();
        let runner: Arc<dyn JobRunner> = self.clone();
        tokio::spawn(dispatcher.run_loop(runner, shutdown));
    }

    /// Admit a new job: validate, fingerprint, persist as pending, and
    /// queue a run request. Returns as soon as the job is admitted; it
    /// never waits for execution.
    pub async fn submit(&self, parameters: Parameters) -> Result<JobId> {
        let fingerprint = parameters.fingerprint()?;
        let job = Job::new(parameters, fingerprint);
        let id = self.store.create(job).await?;

        if let Err(e) = self.dispatcher.enqueue(id).await {
            // Admission failed; do not leave an orphaned pending job.
            let _ = self.store.delete(id).await;
            return Err(e);
        }

        tracing::info!(job_id = %id, fingerprint = %fingerprint, "Job submitted");
        Ok(id)
    }

    /// Cancel a pending or running job.
    ///
    /// Idempotent: a terminal job is left untouched and its current state
    /// returned. Otherwise the in-flight handle is revoked (best-effort,
    /// forceful) and the job moves to failed immediately; if the underlying
    /// work is still winding down, its late state updates are not honored.
    pub async fn cancel(&self, id: JobId) -> Result<JobState> {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;

        let job = self.store.get(id).await?;
        if job.state.is_terminal() {
            tracing::debug!(job_id = %id, state = %job.state, "Cancel is a no-op");
            self.discard_job_lock_if_idle(id, &lock).await;
            return Ok(job.state);
        }

        self.dispatcher.revoke(id).await;
        let job = self
            .store
            .update(
                id,
                Box::new(|job| {
                    job.state = JobState::Failed;
                    job.failure_reason = Some("cancelled by user".to_string());
                    job.task_handle = None;
                    job.completed_at = Some(Utc::now());
                }),
            )
            .await?;

        self.discard_job_lock_if_idle(id, &lock).await;
        tracing::info!(job_id = %id, "Job cancelled");
        Ok(job.state)
    }

    /// Re-enter a terminal job into the pipeline.
    ///
    /// Only completed or failed jobs can be resumed; the stored result and
    /// failure are cleared and the job becomes a logically new run of the
    /// same parameters.
    pub async fn resume(&self, id: JobId) -> Result<()> {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;

        let job = self.store.get(id).await?;
        if !job.state.is_terminal() {
            return Err(SimforgeError::IllegalState {
                id,
                state: job.state,
            });
        }

        self.dispatcher.enqueue(id).await?;
        self.store
            .update(
                id,
                Box::new(|job| {
                    job.state = JobState::Pending;
                    job.result = None;
                    job.task_handle = None;
                    job.failure_reason = None;
                    job.completed_at = None;
                    job.attempts = 0;
                }),
            )
            .await?;

        tracing::info!(job_id = %id, "Job resumed");
        Ok(())
    }

    /// Delete a job and its result. Illegal while the job is running
    /// (cancel first); a cache entry sourced from this job is invalidated
    /// so later lookups cannot point at a deleted result.
    pub async fn delete(&self, id: JobId) -> Result<()> {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;

        let job = self.store.get(id).await?;
        if job.state == JobState::Running {
            return Err(SimforgeError::IllegalState {
                id,
                state: job.state,
            });
        }

        // A pending job may still sit in the queue.
        self.dispatcher.revoke(id).await;

        match self.cache.lookup(&job.parameters_fingerprint).await {
            Ok(Some(entry)) if entry.source_job_id == id => {
                if let Err(e) = self.cache.invalidate(&job.parameters_fingerprint).await {
                    tracing::warn!(job_id = %id, error = %e, "Cache invalidation failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Cache lookup failed during delete");
            }
        }

        self.store.delete(id).await?;
        self.locks.lock().await.remove(&id);
        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView> {
        Ok(self.store.get(id).await?.status_view())
    }

    pub async fn list(&self) -> Result<Vec<JobStatusView>> {
        let jobs = self.store.list(None).await?;
        Ok(jobs.iter().map(Job::status_view).collect())
    }

    /// Remove terminal jobs older than `max_age` and drop cache entries
    /// pointing at them. Running and pending jobs are left alone.
    pub async fn purge_older_than(&self, max_age: std::time::Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| SimforgeError::Internal(e.to_string()))?;
        let cutoff = Utc::now() - max_age;
        let jobs = self.store.list(None).await?;
        let mut purged = 0;

        for job in jobs {
            if !job.state.is_terminal() || job.created_at >= cutoff {
                continue;
            }
            match self.delete(job.id).await {
                Ok(()) => purged += 1,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Purge skipped job");
                }
            }
        }

        if purged > 0 {
            tracing::info!(purged, "Old jobs purged");
        }
        Ok(purged)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn job_lock(&self, id: JobId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a terminal job's transition lock once nobody else holds it, so
    /// the lock map does not grow with every job ever finished. A later
    /// `resume` or `delete` recreates the entry on demand.
    async fn discard_job_lock_if_idle(&self, id: JobId, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // Two strong references are the map entry and our own clone; any
        // waiter holds a third, and removal must wait for it.
        if Arc::strong_count(lock) == 2 {
            locks.remove(&id);
        }
    }

    /// Try to satisfy the job from the cache. Returns true when the result
    /// was copied and the job completed without executing.
    async fn try_cache_copy(&self, job: &Job) -> bool {
        let entry = match self.cache.lookup(&job.parameters_fingerprint).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                // Never fail a job because of the cache.
                tracing::warn!(job_id = %job.id, error = %e, "Cache lookup failed, executing");
                return false;
            }
        };

        // A job must never reuse its own earlier run (possible after a
        // resume repopulates the pipeline while its old entry is live).
        if entry.source_job_id == job.id {
            tracing::debug!(job_id = %job.id, "Ignoring self-referential cache entry");
            return false;
        }

        let source = match self.store.get(entry.source_job_id).await {
            Ok(source) => source,
            Err(_) => {
                tracing::debug!(
                    job_id = %job.id,
                    source_job_id = %entry.source_job_id,
                    "Cache entry points at a missing job, executing"
                );
                return false;
            }
        };
        let Some(result) = source.result else {
            return false;
        };

        // Deep copy: the copied artifacts must stay valid even if the
        // source job is deleted later.
        let copied = result.clone();
        let updated = self
            .store
            .update(
                job.id,
                Box::new(move |job| {
                    job.result = Some(copied);
                    job.state = JobState::Completed;
                    job.completed_at = Some(Utc::now());
                    job.task_handle = None;
                }),
            )
            .await;

        match updated {
            Ok(_) => {
                tracing::info!(
                    job_id = %job.id,
                    source_job_id = %entry.source_job_id,
                    "Job completed from cached result"
                );
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Cache copy failed to persist");
                false
            }
        }
    }

    /// Record the outcome of a finished executor call. Only writes if the
    /// run is still the active one: a cancel that landed first wins.
    async fn finish_run(
        &self,
        id: JobId,
        attempt: u32,
        token: &CancellationToken,
        outcome: std::result::Result<crate::job::SimulationResult, ExecutionError>,
    ) {
        let lock = self.job_lock(id).await;
        let _guard = lock.lock().await;

        let job = match self.store.get(id).await {
            Ok(job) => job,
            // Deleted mid-run; nothing to record.
            Err(_) => return,
        };
        if job.state != JobState::Running || token.is_cancelled() {
            tracing::debug!(job_id = %id, state = %job.state, "Run outcome discarded");
            if job.state.is_terminal() {
                self.discard_job_lock_if_idle(id, &lock).await;
            }
            return;
        }

        match outcome {
            Ok(result) => {
                let persisted = self
                    .store
                    .update(
                        id,
                        Box::new(move |job| {
                            job.result = Some(result);
                            job.state = JobState::Completed;
                            job.completed_at = Some(Utc::now());
                            job.task_handle = None;
                        }),
                    )
                    .await;
                if let Err(e) = persisted {
                    tracing::error!(job_id = %id, error = %e, "Failed to persist result");
                    return;
                }

                // Only real executions seed the cache; cache-hit copies
                // never do, so entries always point at an original result.
                if let Err(e) = self
                    .cache
                    .store(&job.parameters_fingerprint, id, self.config.cache_ttl)
                    .await
                {
                    tracing::warn!(job_id = %id, error = %e, "Result not cached");
                }

                self.dispatcher.release(id).await;
                self.discard_job_lock_if_idle(id, &lock).await;
                tracing::info!(job_id = %id, "Job completed");
            }
            Err(error) if error.is_transient() && attempt < self.config.max_retries => {
                let delay = self.config.backoff_delay(attempt);
                let persisted = self
                    .store
                    .update(
                        id,
                        Box::new(|job| {
                            job.state = JobState::Pending;
                            job.task_handle = None;
                        }),
                    )
                    .await;
                if persisted.is_err() {
                    return;
                }

                tracing::warn!(
                    job_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retry scheduled"
                );
                self.dispatcher.schedule_retry(id, attempt + 1, delay);
            }
            Err(error) => {
                let reason = error.to_string();
                let persisted = self
                    .store
                    .update(
                        id,
                        Box::new(move |job| {
                            job.state = JobState::Failed;
                            job.failure_reason = Some(reason);
                            job.task_handle = None;
                            job.completed_at = Some(Utc::now());
                        }),
                    )
                    .await;
                if persisted.is_err() {
                    return;
                }

                self.dispatcher.release(id).await;
                self.discard_job_lock_if_idle(id, &lock).await;
                tracing::error!(job_id = %id, error = %error, "Job failed");
            }
        }
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    /// Run one attempt of a job on a worker slot.
    ///
    /// Pending -> running under the per-job lock, then either a cache copy
    /// (no executor call) or an executor invocation raced against the
    /// revocation token and the hard deadline.
    async fn run(&self, request: RunRequest, token: CancellationToken) {
        let RunRequest { job_id: id, attempt } = request;

        let parameters = {
            let lock = self.job_lock(id).await;
            let _guard = lock.lock().await;

            let job = match self.store.get(id).await {
                Ok(job) => job,
                Err(_) => {
                    // Deleted while queued.
                    self.dispatcher.release(id).await;
                    return;
                }
            };
            // Anything but pending means a cancel or a concurrent run beat
            // this request to the job; the request is stale.
            if job.state != JobState::Pending || token.is_cancelled() {
                return;
            }

            let handle = TaskHandle::new();
            let marked = self
                .store
                .update(
                    id,
                    Box::new(move |job| {
                        job.state = JobState::Running;
                        job.task_handle = Some(handle);
                        job.attempts += 1;
                    }),
                )
                .await;
            let job = match marked {
                Ok(job) => job,
                Err(_) => return,
            };
            tracing::info!(job_id = %id, attempt, "Job running");

            if self.try_cache_copy(&job).await {
                self.dispatcher.release(id).await;
                self.discard_job_lock_if_idle(id, &lock).await;
                return;
            }

            job.parameters
            // Lock released here; the solve must not hold it.
        };

        let ctx = ExecutionContext {
            job_id: id,
            soft_deadline: self.config.soft_deadline,
        };
        let executor = self.executor.clone();
        let hard_deadline = self.config.hard_deadline;

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                // Cancel already transitioned the job; drop the run.
                tracing::debug!(job_id = %id, "Run revoked mid-flight");
                return;
            }
            result = tokio::time::timeout(hard_deadline, executor.execute(&parameters, &ctx)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ExecutionError::Transient(format!(
                        "hard deadline of {}s exceeded",
                        hard_deadline.as_secs()
                    ))),
                }
            }
        };

        self.finish_run(id, attempt, &token, outcome).await;
    }
}
