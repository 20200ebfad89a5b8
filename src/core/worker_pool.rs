//! # Worker Pool
//!
//! A bounded executor for fallible units of work. A pool of size `N > 0` runs its items on
//! a dedicated `rayon` thread pool with exactly `N` threads, so at most `N` items execute at
//! once no matter how many are queued. A pool of size `0` gives every item its own thread.
//!
//! The pool never retries and never aggregates errors: each item reports its own outcome
//! (usually into a [`Task`](crate::core::tracker::Task)). It only guarantees that every
//! accepted item eventually runs, and that [`Completion::wait`] returns once the pool has
//! been stopped and the queue has drained.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A queued unit of work.
pub type WorkItem = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool stopped")]
    Stopped,
    #[error("Could not create worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

type PoolResult<T> = Result<T, PoolError>;

#[derive(Default)]
struct PoolState {
    stopped: bool,
    /// Items accepted but not yet finished.
    outstanding: usize,
    /// Items accepted before `start`.
    backlog: VecDeque<WorkItem>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<PoolState>,
    drained: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn finish_one(&self) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

enum Executor {
    Unbounded,
    Bounded(rayon::ThreadPool),
}

/// A pool of workers. See the module documentation.
pub struct Pool {
    size: usize,
    shared: Arc<Shared>,
    executor: Mutex<Option<Executor>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Pool")
            .field("size", &self.size)
            .field("stopped", &state.stopped)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

impl Pool {
    /// Creates a pool with `size` workers; `0` means unbounded concurrency.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            shared: Arc::new(Shared::default()),
            executor: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Starts the workers and dispatches anything enqueued before now.
    pub fn start(&self) -> PoolResult<()> {
        let mut executor = self
            .executor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if executor.is_some() {
            return Ok(());
        }
        let started = if self.size == 0 {
            Executor::Unbounded
        } else {
            let threads = rayon::ThreadPoolBuilder::new()
                .num_threads(self.size)
                .thread_name(|i| format!("muster-worker-{}", i))
                .panic_handler(|_| log::error!("A worker panicked while running a work item."))
                .build()?;
            Executor::Bounded(threads)
        };
        log::debug!("Worker pool started with size {}.", self.size);

        let mut backlog: VecDeque<WorkItem> = self.shared.lock().backlog.drain(..).collect();
        while let Some(work) = backlog.pop_front() {
            if let Err(e) = self.dispatch(&started, work) {
                // The rest of the backlog will never run; stop counting it.
                for _ in 0..backlog.len() {
                    self.shared.finish_one();
                }
                return Err(e);
            }
        }
        *executor = Some(started);
        Ok(())
    }

    /// Queues a unit of work. Fails with [`PoolError::Stopped`] once [`Pool::stop`] was called.
    pub fn enqueue<F>(&self, work: F) -> PoolResult<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let executor = self
            .executor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(PoolError::Stopped);
            }
            state.outstanding += 1;
            if executor.is_none() {
                state.backlog.push_back(Box::new(work));
                return Ok(());
            }
        }
        match executor.as_ref() {
            Some(started) => self.dispatch(started, Box::new(work)),
            None => Ok(()),
        }
    }

    fn dispatch(&self, executor: &Executor, work: WorkItem) -> PoolResult<()> {
        let shared = Arc::clone(&self.shared);
        let job = move || {
            // Counts the item as finished even if it panics.
            scopeguard::defer! { shared.finish_one(); }
            if let Err(e) = work() {
                log::debug!("Work item finished with error: {:#}", e);
            }
        };
        match executor {
            Executor::Bounded(threads) => {
                threads.spawn(job);
                Ok(())
            }
            Executor::Unbounded => {
                let spawned = std::thread::Builder::new()
                    .name("muster-worker".to_string())
                    .spawn(job);
                if let Err(e) = spawned {
                    self.shared.finish_one();
                    return Err(PoolError::Spawn(e));
                }
                Ok(())
            }
        }
    }

    /// Stops accepting work. Queued items still run.
    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if !state.stopped {
            log::debug!(
                "Worker pool stopping with {} item(s) outstanding.",
                state.outstanding
            );
        }
        state.stopped = true;
        if state.outstanding == 0 {
            self.shared.drained.notify_all();
        }
    }

    /// A signal that fires once the pool is stopped and every accepted item has finished.
    pub fn complete(&self) -> Completion {
        Completion {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Completion signal returned by [`Pool::complete`].
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

impl Completion {
    pub fn is_done(&self) -> bool {
        let state = self.shared.lock();
        state.stopped && state.outstanding == 0
    }

    /// Blocks until the pool is stopped and drained.
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while !(state.stopped && state.outstanding == 0) {
            state = self
                .shared
                .drained
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`Completion::wait`] with an upper bound. Returns `true` if the pool completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !(state.stopped && state.outstanding == 0) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .drained
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}
