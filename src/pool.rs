//! Disposal worker pool.
//!
//! Tearing down a large sorted collection touches every node it owns, which
//! is exactly the kind of latency spike the event loop must not absorb. The
//! loop unlinks such a value from the keyspace, moves it into a task, and
//! submits that task here; a worker drops it in the background.
//!
//! Tasks are fire-and-forget: nothing is returned to the submitter.
//!
//! ## Shutdown
//!
//! Shutdown drains. Workers only exit once the stop flag is raised *and*
//! the queue is empty, so every submitted task runs before `shutdown`
//! (or `Drop`) returns.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Default number of disposal workers.
pub const DEFAULT_WORKERS: usize = 4;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    stopping: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
}

/// A fixed-size pool of threads running queued disposal work.
pub struct DisposalPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for DisposalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposalPool")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl DisposalPool {
    /// Spawns `workers` threads (at least one).
    pub fn new(workers: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let count = workers.max(1);

        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("disposal-{}", id))
                .spawn(move || worker_loop(id, shared))?;
            handles.push(handle);
        }

        info!(workers = count, "Disposal pool started");
        Ok(Self {
            shared,
            workers: handles,
        })
    }

    /// Queues a unit of work.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.lock().tasks.push_back(Box::new(task));
        self.shared.not_empty.notify_one();
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Stops the workers after the queue drains and joins them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        self.shared.queue.lock().stopping = true;
        self.shared.not_empty.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Disposal worker exited abnormally");
            }
        }
        info!("Disposal pool stopped");
    }
}

impl Drop for DisposalPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            while queue.tasks.is_empty() && !queue.stopping {
                shared.not_empty.wait(&mut queue);
            }
            match queue.tasks.pop_front() {
                Some(task) => task,
                // Stopping and drained.
                None => break,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!(worker = id, "Disposal task panicked");
        }
    }
    debug!(worker = id, "Disposal worker exiting");
}
