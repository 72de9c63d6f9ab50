//! Dispatching: the pump that drains the prioritized root and the worker
//! pool that executes micro-jobs.
//!
//! The dispatcher is a single task. It pulls one item at a time from the
//! scheduler root; micro-jobs go over a bounded channel to the worker pool,
//! macro messages are expanded on the spot and their yielded micro-jobs are
//! inserted back into the owning client queue — which is what makes
//! expansion lazy: nothing unrolls until the scheduler actually reached the
//! macro entry.
//!
//! Workers execute through the [`JobExecutor`] seam (the concrete worker is
//! an external collaborator) under the job's cancellation token, store the
//! result on the child promise, and post the measured charge back against
//! the scheduling account.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{JobError, JobErrorKind, SluiceError};
use crate::flow::ScheduledItem;
use crate::manager::{JobMessage, WorkDescriptor};
use crate::priority::PriorityScheduler;
use crate::promise::{PromiseOutcome, PromisePayload};

/// A long-running component of the server.
///
/// Implementations run until their work is done or the shutdown token
/// fires, whichever comes first.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), SluiceError>;
}

/// Executes one unit of work. The concrete worker — compute, remote
/// invocation, whatever — lives outside the core.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        work: &WorkDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PromisePayload, JobError>;
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Pumps the prioritized root channel into the worker distribution channel.
pub struct JobDispatcher {
    scheduler: Arc<PriorityScheduler>,
    workers: mpsc::Sender<JobMessage>,
}

impl JobDispatcher {
    pub fn new(scheduler: Arc<PriorityScheduler>, workers: mpsc::Sender<JobMessage>) -> Self {
        Self { scheduler, workers }
    }

    async fn dispatch(&self, item: ScheduledItem) {
        match item {
            ScheduledItem::Job(message) => {
                if message.cancel.is_cancelled() {
                    complete_cancelled(&message);
                    return;
                }
                // Bounded send: backpressure from a saturated worker pool
                // parks the dispatcher rather than piling work up.
                if self.workers.send(message).await.is_err() {
                    warn!("worker channel closed; dropping job");
                }
            }
            ScheduledItem::Macro(message) => {
                let queue = message.queue().clone();
                let result = message.expand(&mut |job| {
                    queue.enqueue(ScheduledItem::Job(job));
                });
                if let Err(e) = result {
                    warn!(
                        promise_id = %message.source().promise_id(),
                        error = %e,
                        "macro expansion refused"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Service for JobDispatcher {
    fn name(&self) -> &'static str {
        "job-dispatcher"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), SluiceError> {
        info!("dispatcher starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = self.scheduler.take() => self.dispatch(item).await,
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Fixed-size pool of worker tasks draining the dispatch channel.
pub struct WorkerPool {
    executor: Arc<dyn JobExecutor>,
    jobs: mpsc::Receiver<JobMessage>,
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        jobs: mpsc::Receiver<JobMessage>,
        worker_count: usize,
    ) -> Self {
        Self {
            executor,
            jobs,
            worker_count: worker_count.max(1),
        }
    }
}

#[async_trait]
impl Service for WorkerPool {
    fn name(&self) -> &'static str {
        "worker-pool"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), SluiceError> {
        info!(workers = self.worker_count, "worker pool starting");
        let jobs = Arc::new(tokio::sync::Mutex::new(self.jobs));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.worker_count);
        for worker_index in 0..self.worker_count {
            let executor = self.executor.clone();
            let jobs = jobs.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let message = {
                        let mut receiver = jobs.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            message = receiver.recv() => message,
                        }
                    };
                    let Some(message) = message else { break };
                    run_job(&*executor, message).await;
                }
                trace!(worker = worker_index, "worker stopped");
            }));
        }

        futures::future::join_all(handles).await;
        info!("worker pool stopped");
        Ok(())
    }
}

/// Execute one micro-job and settle its promise and account.
async fn run_job(executor: &dyn JobExecutor, message: JobMessage) {
    if message.cancel.is_cancelled() {
        complete_cancelled(&message);
        return;
    }

    let started = Instant::now();
    let result = tokio::select! {
        _ = message.cancel.cancelled() => Err(JobError::cancelled(None)),
        result = executor.execute(&message.work, &message.cancel) => result,
    };
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let outcome = match result {
        Ok(payload) => PromiseOutcome::Completed(payload),
        Err(error) => {
            if error.kind != JobErrorKind::Cancelled {
                debug!(
                    promise_id = %message.promise.id(),
                    job_type = %message.work.job_type,
                    error = %error,
                    "job failed"
                );
            }
            PromiseOutcome::Failed(error)
        }
    };
    message.promise.try_complete(outcome);

    // Time-weighted accounting: replace the estimate charged at dequeue
    // with the measured cost.
    message
        .account
        .add_charge(elapsed_ms - message.work.initial_charge);
}

/// Settle a job that was cancelled before (or instead of) executing. The
/// child promise must still complete, or waiters on the aggregate result
/// would hang.
fn complete_cancelled(message: &JobMessage) {
    message.promise.try_complete(PromiseOutcome::Failed(JobError::cancelled(None)));
    trace!(promise_id = %message.promise.id(), "job dropped by cancellation");
}
