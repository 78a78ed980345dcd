// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! A bounded worker-thread pool for blocking work.
//!
//! The pool is the execution-scheduler collaborator of the tracing core: a
//! job may be scheduled together with an optional [`ContextCarrier`], which
//! the worker activates immediately before the job runs and deactivates once
//! it finishes. Jobs scheduled without a carrier run isolated, so a reused
//! worker thread never leaks an earlier attribution into them.
//!
//! Queue exhaustion is the application's own resource limit, not a tracing
//! error, and is the one failure surfaced to the caller.

use crate::context::{self, ActiveContext, ContextCarrier};
use std::panic::AssertUnwindSafe;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// Worker pool config.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of worker threads. Default is 2, and zero means 2.
    pub(crate) workers: usize,
    /// Bounded job-queue capacity. Default is 64, and zero means 64.
    pub(crate) queue_capacity: usize,
    /// Worker thread name prefix.
    pub(crate) thread_name: String,
}

impl PoolConfig {
    /// Create a new pool config. Zero workers means the default of 2.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: if workers == 0 { 2 } else { workers },
            queue_capacity: 64,
            thread_name: "spanlink-worker".to_string(),
        }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Set the bounded job-queue capacity. Default is 64, and zero means 64.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        if queue_capacity == 0 {
            self.queue_capacity = 64;
        } else {
            self.queue_capacity = queue_capacity;
        }
        self
    }

    /// Bounded job-queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Set the worker thread name prefix. Default is `spanlink-worker`.
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Worker thread name prefix.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }
}

/// Errors surfaced by scheduling calls.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The bounded job queue is at capacity.
    #[error("worker queue is full")]
    QueueFull,
    /// The pool has shut down and accepts no further jobs.
    #[error("worker pool is shut down")]
    Closed,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    carrier: Option<ContextCarrier>,
    job: Job,
}

/// A fixed set of worker threads draining a bounded job queue.
pub struct WorkerPool {
    sender: SyncSender<QueuedJob>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the configured worker threads.
    pub fn build(config: PoolConfig) -> Result<Self, PoolError> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new().name(format!("{}-{index}", config.thread_name)).spawn(move || Self::run_worker(receiver))?;
            workers.push(handle);
        }
        Ok(Self { sender, workers })
    }

    fn run_worker(receiver: Arc<Mutex<Receiver<QueuedJob>>>) {
        loop {
            let next = {
                let guard = receiver.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.recv()
            };
            let Ok(QueuedJob { carrier, job }) = next else {
                // All senders dropped: pool shut down.
                break;
            };
            let _active: ActiveContext = match &carrier {
                Some(carrier) => carrier.activate(),
                None => context::isolate(),
            };
            if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("worker job panicked");
            }
        }
    }

    /// Schedules a job, attaching an optional propagation carrier that the
    /// executing worker activates around it.
    ///
    /// Fails with [`PoolError::QueueFull`] when the bounded queue is at
    /// capacity; the job is dropped, which still runs any completion guards
    /// it owns.
    pub fn try_execute<F>(&self, carrier: Option<ContextCarrier>, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.try_send(QueuedJob { carrier, job: Box::new(job) }).map_err(|err| match err {
            TrySendError::Full(_) => PoolError::QueueFull,
            TrySendError::Disconnected(_) => PoolError::Closed,
        })
    }

    /// Stops accepting jobs, drains the queue, and joins the workers.
    pub fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
    }
}
