//! Bounded worker pool.
//!
//! A fixed number of workers drain a capacity-bounded queue of tasks:
//! - `submit` waits while the queue is full instead of dropping work
//! - a task's steps run in order and the first failing step ends the task
//! - each submission returns a [`Ticket`] resolving to the task outcome
//! - `stop` closes intake and waits for queued and running tasks to finish;
//!   on a pool that never started, queued tickets resolve to `OutcomeLost`
//!
//! Nothing here is persisted. Tasks queued at process exit are lost; the
//! owning job record is still unfinished and resubmits them.

use crate::error::{PoolError, StepError};
use async_trait::async_trait;
use dockyard_core::TaskId;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One unit of work inside a task.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short description used in logs and failure reports.
    fn describe(&self) -> String;

    /// Performs the step.
    async fn run(&self) -> Result<(), StepError>;
}

/// An ordered list of steps executed by one worker.
pub struct Task {
    id: TaskId,
    steps: Vec<Box<dyn Step>>,
}

impl Task {
    /// Creates an empty task.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TaskId::new(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the task has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    async fn execute(self) -> TaskOutcome {
        let total = self.steps.len();
        for (index, step) in self.steps.iter().enumerate() {
            if let Err(error) = step.run().await {
                return TaskOutcome::Failed {
                    id: self.id,
                    step: step.describe(),
                    completed: index,
                    error,
                };
            }
        }
        TaskOutcome::Succeeded {
            id: self.id,
            completed: total,
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every step succeeded.
    Succeeded { id: TaskId, completed: usize },
    /// A step failed; the steps after it were not run.
    Failed {
        id: TaskId,
        step: String,
        completed: usize,
        error: StepError,
    },
}

impl TaskOutcome {
    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        match self {
            Self::Succeeded { id, .. } | Self::Failed { id, .. } => *id,
        }
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Resolves to the outcome of a submitted task.
#[derive(Debug)]
pub struct Ticket {
    id: TaskId,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl Ticket {
    /// Returns the task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns `OutcomeLost` if the worker went away before reporting.
    pub async fn outcome(self) -> Result<TaskOutcome, PoolError> {
        self.outcome
            .await
            .map_err(|_| PoolError::OutcomeLost { task: self.id })
    }
}

struct Queued {
    task: Task,
    reply: oneshot::Sender<TaskOutcome>,
}

/// A fixed-size pool of workers over a bounded queue.
pub struct WorkerPool {
    intake: Mutex<Option<mpsc::Sender<Queued>>>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a stopped pool whose queue holds up to `capacity` tasks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            intake: Mutex::new(Some(sender)),
            queue: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Launches `workers` workers.
    ///
    /// # Errors
    ///
    /// Returns `NoWorkers` for zero workers, `AlreadyStarted` if workers are
    /// running, or `Stopped` after [`WorkerPool::stop`].
    pub fn start(&self, workers: usize) -> Result<(), PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        if self.lock_intake().is_none() {
            return Err(PoolError::Stopped);
        }
        let mut handles = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            return Err(PoolError::AlreadyStarted);
        }

        for worker in 0..workers {
            let queue = Arc::clone(&self.queue);
            handles.push(tokio::spawn(work(worker, queue)));
        }
        info!(workers, "worker pool started");
        Ok(())
    }

    /// Queues a task, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` once the pool has been stopped.
    pub async fn submit(&self, task: Task) -> Result<Ticket, PoolError> {
        let sender = self.lock_intake().clone().ok_or(PoolError::Stopped)?;
        let id = task.id();
        let (reply, outcome) = oneshot::channel();

        sender
            .send(Queued { task, reply })
            .await
            .map_err(|_| PoolError::Stopped)?;
        debug!(task = %id, "task queued");
        Ok(Ticket { id, outcome })
    }

    /// Closes intake and waits for every queued and running task.
    pub async fn stop(&self) {
        drop(self.lock_intake().take());
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }

        // Left over only when no worker ever ran. Dropping the reply senders
        // resolves their tickets.
        let mut queue = self.queue.lock().await;
        queue.close();
        while let Ok(Queued { task, .. }) = queue.try_recv() {
            warn!(task = %task.id(), "pool stopped before task ran");
        }
        info!("worker pool stopped");
    }

    fn lock_intake(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Queued>>> {
        self.intake.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn work(worker: usize, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>) {
    loop {
        // Hold the receiver only while waiting, so other workers can run.
        let next = queue.lock().await.recv().await;
        let Some(Queued { task, reply }) = next else {
            debug!(worker, "queue closed, worker exiting");
            return;
        };

        let id = task.id();
        let outcome = task.execute().await;
        match &outcome {
            TaskOutcome::Succeeded { completed, .. } => {
                debug!(worker, task = %id, completed, "task succeeded");
            }
            TaskOutcome::Failed { step, error, .. } => {
                warn!(worker, task = %id, %step, %error, "task failed");
            }
        }
        // The submitter may have stopped waiting.
        let _ = reply.send(outcome);
    }
}
