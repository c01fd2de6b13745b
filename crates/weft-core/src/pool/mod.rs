//! Fixed-size worker pool over a FIFO task queue.
//!
//! Internals are composed from the crate's own primitives: the queue is
//! guarded by a [`Mutex`](crate::sync::Mutex), workers sleep on a non-empty
//! [`Cond`](crate::sync::Cond), and each worker is a
//! [`Thread`](crate::thread::Thread).
//!
//! Submission order is strictly FIFO; submitters never block on queue
//! capacity. [`Pool::wait`] quiesces the queue only; it does not wait for
//! tasks already handed to a worker, because tasks execute outside the lock
//! and carry no completion signal.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sync::{Cond, Mutex};
use crate::thread::{sleep_ms, Thread};

/// A queued unit of work.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue-drain poll granularity for [`Pool::wait`].
const QUIESCE_POLL_MS: u64 = 1;

struct PoolShared {
    queue_mutex: Mutex,
    not_empty: Cond,
    /// FIFO task queue. Accessed only while `queue_mutex` is held.
    queue: UnsafeCell<VecDeque<Task>>,
    /// Mirror of the queue depth, readable without the queue lock.
    depth: AtomicUsize,
    stop: AtomicBool,
}

// SAFETY: the queue cell is only dereferenced by threads holding
// `queue_mutex`; every access site documents the held lock.
unsafe impl Sync for PoolShared {}

impl PoolShared {
    /// # Safety
    ///
    /// Caller must hold `queue_mutex`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn queue_mut(&self) -> &mut VecDeque<Task> {
        unsafe { &mut *self.queue.get() }
    }
}

/// Fixed worker-count task pool.
pub struct Pool {
    shared: Arc<PoolShared>,
    workers: parking_lot::Mutex<Vec<Thread<()>>>,
    down: AtomicBool,
}

impl Pool {
    /// Create a pool with `workers` threads.
    ///
    /// Errors: `InvalidArgument` for zero workers; sub-component init and
    /// thread spawn failures are surfaced (`ResourceExhausted` et al.).
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidArgument);
        }
        let queue_mutex = Mutex::new();
        queue_mutex.init()?;
        let not_empty = Cond::new();
        if let Err(e) = not_empty.init() {
            queue_mutex.dispose();
            return Err(e);
        }

        let shared = Arc::new(PoolShared {
            queue_mutex,
            not_empty,
            queue: UnsafeCell::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            workers: parking_lot::Mutex::new(Vec::with_capacity(workers)),
            down: AtomicBool::new(false),
        };

        for _ in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let worker: Thread<()> = Thread::new();
            if let Err(e) = worker.spawn(move |_| worker_loop(&shared)) {
                pool.shutdown();
                return Err(e);
            }
            pool.workers.lock().push(worker);
        }
        Ok(pool)
    }

    /// Append a task at the queue tail and wake one worker.
    ///
    /// Errors: `Cancelled` once shutdown has begun.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let s = &self.shared;
        s.queue_mutex.lock()?;
        if s.stop.load(Ordering::Acquire) {
            s.queue_mutex.unlock()?;
            return Err(Error::Cancelled);
        }
        // SAFETY: queue_mutex held.
        unsafe { s.queue_mut() }.push_back(Box::new(task));
        s.depth.fetch_add(1, Ordering::Release);
        if let Err(e) = s.not_empty.signal() {
            let _ = s.queue_mutex.unlock();
            return Err(e);
        }
        s.queue_mutex.unlock()?;
        Ok(())
    }

    /// Block until the queue drains, polling the depth at millisecond
    /// granularity. Does not wait for tasks already executing on workers.
    pub fn wait(&self) {
        while self.shared.depth.load(Ordering::Acquire) != 0 {
            sleep_ms(QUIESCE_POLL_MS);
        }
    }

    /// Queue depth at this instant: tasks submitted but not yet handed to a
    /// worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// Stop accepting tasks, wake all workers, join them, and drop any
    /// unexecuted tasks. Idempotent; also run by `Drop`.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let s = &self.shared;
        if s.queue_mutex.lock().is_ok() {
            s.stop.store(true, Ordering::Release);
            let _ = s.not_empty.broadcast();
            let _ = s.queue_mutex.unlock();
        } else {
            s.stop.store(true, Ordering::Release);
        }

        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
            worker.dispose();
        }

        // Workers are gone; drop whatever never ran.
        if s.queue_mutex.lock().is_ok() {
            // SAFETY: queue_mutex held.
            unsafe { s.queue_mut() }.clear();
            s.depth.store(0, Ordering::Release);
            let _ = s.queue_mutex.unlock();
        }
        s.not_empty.dispose();
        s.queue_mutex.dispose();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("queued", &self.queued())
            .field("stopped", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(shared: &PoolShared) {
    if shared.queue_mutex.lock().is_err() {
        return;
    }
    loop {
        // SAFETY: queue_mutex held at every check of the queue.
        while unsafe { shared.queue_mut() }.is_empty() && !shared.stop.load(Ordering::Acquire) {
            if shared.not_empty.wait(&shared.queue_mutex).is_err() {
                return;
            }
        }
        if shared.stop.load(Ordering::Acquire) {
            let _ = shared.queue_mutex.unlock();
            return;
        }
        // SAFETY: queue_mutex held.
        let task = unsafe { shared.queue_mut() }.pop_front();
        let Some(task) = task else {
            continue;
        };
        shared.depth.fetch_sub(1, Ordering::Release);
        if shared.queue_mutex.unlock().is_err() {
            return;
        }

        task();

        if shared.queue_mutex.lock().is_err() {
            return;
        }
    }
}
