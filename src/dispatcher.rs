use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SimforgeError};
use crate::job::JobId;

/// One scheduled invocation of a job run. `attempt` is zero-based and
/// carried through retries so backoff can grow per attempt.
#[derive(Debug, Clone, Copy)]
pub struct RunRequest {
    pub job_id: JobId,
    pub attempt: u32,
}

/// Implemented by the orchestrator; invoked on a worker slot for each
/// dequeued run request. The token is the job's revocation handle: when it
/// fires, the run must stop making state updates.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, request: RunRequest, token: CancellationToken);
}

/// Bounded FIFO queue feeding a bounded worker pool.
///
/// Admission is explicit: a full queue rejects with `QueueFull` instead of
/// growing without bound. Concurrency is capped by a semaphore of
/// `worker_pool_size` permits. Each admitted job gets a `CancellationToken`
/// registered until it reaches a terminal state, which `revoke` fires to
/// drop a queued request or forcefully stop a running one.
pub struct Dispatcher {
    tx: mpsc::Sender<RunRequest>,
    rx: Mutex<Option<mpsc::Receiver<RunRequest>>>,
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(queue_depth: usize, worker_pool_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            tokens: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
        }
    }

    /// Schedule a first run of a job. Registers a fresh revocation token
    /// (replacing a cancelled leftover, e.g. after cancel-then-resume).
    pub async fn enqueue(&self, job_id: JobId) -> Result<()> {
        {
            let mut tokens = self.tokens.lock().await;
            match tokens.get(&job_id) {
                Some(token) if !token.is_cancelled() => {}
                _ => {
                    tokens.insert(job_id, CancellationToken::new());
                }
            }
        }

        let sent = self
            .tx
            .try_send(RunRequest { job_id, attempt: 0 })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SimforgeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => {
                    SimforgeError::Internal("dispatcher is shut down".to_string())
                }
            });
        if sent.is_err() {
            // Admission failed, so the token registered above is orphaned.
            self.tokens.lock().await.remove(&job_id);
        }
        sent
    }

    /// Re-enqueue a retry after `delay`, keeping the job's existing token
    /// so cancellation during backoff still lands. The sleep happens on a
    /// detached task, never on a worker slot.
    pub fn schedule_retry(&self, job_id: JobId, attempt: u32, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(RunRequest { job_id, attempt }).await.is_err() {
                tracing::warn!(job_id = %job_id, "Dispatcher gone, retry dropped");
            }
        });
    }

    /// Best-effort revocation: fires the token and forgets it. A queued
    /// request is dropped before it starts; a running one is raced against
    /// the token by the runner. Returns whether an in-flight handle existed.
    pub async fn revoke(&self, job_id: JobId) -> bool {
        let token = self.tokens.lock().await.remove(&job_id);
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id = %job_id, "In-flight handle revoked");
                true
            }
            None => false,
        }
    }

    /// Forget a job's token once its run reached a terminal state.
    pub async fn release(&self, job_id: JobId) {
        self.tokens.lock().await.remove(&job_id);
    }

    pub async fn has_handle(&self, job_id: JobId) -> bool {
        self.tokens.lock().await.contains_key(&job_id)
    }

    /// Run the dispatch loop until shutdown. Dequeues FIFO, acquires a
    /// worker permit, and spawns the runner; the permit is held for the
    /// duration of the run, which is what bounds concurrency.
    ///
    /// Panics if called twice; the receiver can only be taken once.
    pub async fn run_loop(
        self: Arc<Self>,
        runner: Arc<dyn JobRunner>,
        shutdown: CancellationToken,
    ) {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("dispatch loop already started");

        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let token = {
                let tokens = self.tokens.lock().await;
                tokens.get(&request.job_id).cloned()
            };
            // No token means the job was revoked while queued.
            let Some(token) = token else {
                tracing::debug!(job_id = %request.job_id, "Dropping revoked queued request");
                continue;
            };
            if token.is_cancelled() {
                continue;
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let runner = runner.clone();
            tokio::spawn(async move {
                runner.run(request, token).await;
                drop(permit);
            });
        }

        tracing::info!("Dispatcher drained");
    }
}
