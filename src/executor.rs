use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::job::{JobId, SimulationResult};
use crate::params::Parameters;

/// How an execution failed, which decides the retry policy: transient
/// failures (engine crashed, resource exhaustion, timeout) are retried
/// with backoff, permanent ones (the parameter set is unsolvable) are not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }
}

/// Per-run context handed to the engine.
///
/// The soft deadline is advisory: the engine is expected to checkpoint and
/// wind down once it passes. The hard deadline is enforced outside the
/// engine by the orchestrator, which reclaims the worker.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub soft_deadline: Duration,
}

/// Invokes the numeric solver for one job's parameters.
///
/// The solver is an opaque black box, potentially minutes per call. The
/// orchestrator only cares about the bundle/failure contract.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        parameters: &Parameters,
        ctx: &ExecutionContext,
    ) -> Result<SimulationResult, ExecutionError>;
}

/// A single long-lived solver engine handle.
///
/// Handles are stateful per process and not safe to share across
/// concurrent jobs; the pool below guarantees exclusive checkout.
#[async_trait]
pub trait SolverEngine: Send {
    /// Clear any state left over from the previous run.
    async fn reset(&mut self) -> Result<(), ExecutionError>;

    async fn solve(
        &mut self,
        parameters: &Parameters,
        ctx: &ExecutionContext,
    ) -> Result<SimulationResult, ExecutionError>;
}

pub type EngineFactory = Arc<dyn Fn() -> Box<dyn SolverEngine> + Send + Sync>;

/// Fixed-size pool of solver engine handles.
///
/// Each handle is exclusively checked out for the duration of one job and
/// returned afterward. A handle whose run failed or was aborted mid-solve
/// is dropped instead of returned, and the next checkout builds a
/// replacement via the factory, so a wedged engine never leaks into a
/// later job.
pub struct EnginePool {
    idle: Mutex<Vec<Box<dyn SolverEngine>>>,
    slots: Arc<Semaphore>,
    factory: EngineFactory,
}

impl EnginePool {
    pub fn new(size: usize, factory: EngineFactory) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(size)),
            slots: Arc::new(Semaphore::new(size)),
            factory,
        })
    }

    /// Check out an engine, waiting for a free slot if the pool is busy.
    pub async fn checkout(self: &Arc<Self>) -> Result<EngineLease, ExecutionError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::Transient("engine pool closed".to_string()))?;

        let engine = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.pop()
        };
        let engine = engine.unwrap_or_else(|| (self.factory)());

        Ok(EngineLease {
            engine: Some(engine),
            pool: Arc::clone(self),
            dirty: true,
            _permit: permit,
        })
    }
}

/// RAII checkout of one engine handle.
///
/// A lease starts dirty and stays dirty until `mark_clean` is called after
/// a run completed normally. Drop returns a clean handle to the pool and
/// tears down a dirty one, so a run that errored, timed out, or had its
/// future dropped mid-solve never leaks a wedged engine into a later job.
pub struct EngineLease {
    engine: Option<Box<dyn SolverEngine>>,
    pool: Arc<EnginePool>,
    dirty: bool,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    pub fn engine(&mut self) -> &mut dyn SolverEngine {
        // The option is only empty inside drop.
        self.engine.as_mut().expect("engine lease already released").as_mut()
    }

    /// Declare the run finished cleanly; the handle goes back to the pool
    /// on drop instead of being torn down.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if self.dirty {
                tracing::warn!("Discarding solver engine handle after unclean run");
            } else {
                let mut idle = self.pool.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.push(engine);
            }
        }
    }
}

/// `Executor` backed by an [`EnginePool`].
pub struct PooledExecutor {
    pool: Arc<EnginePool>,
}

impl PooledExecutor {
    pub fn new(pool_size: usize, factory: EngineFactory) -> Self {
        Self {
            pool: EnginePool::new(pool_size, factory),
        }
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    async fn execute(
        &self,
        parameters: &Parameters,
        ctx: &ExecutionContext,
    ) -> Result<SimulationResult, ExecutionError> {
        let mut lease = self.pool.checkout().await?;

        let run = async {
            lease.engine().reset().await?;
            lease.engine().solve(parameters, ctx).await
        };

        match run.await {
            Ok(result) => {
                lease.mark_clean();
                tracing::debug!(job_id = %ctx.job_id, "Solver run succeeded");
                Ok(result)
            }
            Err(e) => {
                // The lease stays dirty; the handle may hold partial
                // solver state after a failure.
                tracing::warn!(job_id = %ctx.job_id, error = %e, "Solver run failed");
                Err(e)
            }
        }
    }
}
