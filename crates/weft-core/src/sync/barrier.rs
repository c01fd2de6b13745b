//! N-party rendezvous barrier.
//!
//! Built from an embedded [`Mutex`] and [`Cond`]. Each cohort of `threshold`
//! waiters is identified by a generation counter: the arrival that completes
//! the cohort advances the generation, zeroes the count, and broadcasts;
//! earlier arrivals wait until the generation they entered under changes.
//!
//! A one-shot barrier releases exactly one cohort. An extra waiter that
//! arrives after a one-shot barrier released joins a generation that will
//! never fill and blocks until `destroy` (which makes it return
//! `InvalidArgument`); `reset` is ignored on one-shot barriers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::{Cond, Mutex, Slot};

struct BarrierBacking {
    mutex: Mutex,
    cond: Cond,
    threshold: usize,
    cyclic: bool,
    /// Arrivals in the current generation. Mutated only under `mutex`.
    count: AtomicUsize,
    /// Advances each time a cohort is released. Mutated only under `mutex`.
    generation: AtomicU64,
    destroyed: AtomicBool,
}

/// Barrier handle.
pub struct Barrier {
    slot: Slot<BarrierBacking>,
}

impl Barrier {
    /// Create a fresh, uninitialized handle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Slot::empty(),
        }
    }

    /// Initialize with a party threshold and cyclic/one-shot mode.
    ///
    /// Errors: `InvalidArgument` for threshold 0, `Busy` if already
    /// initialized. A failure initializing the embedded mutex or condition
    /// variable is surfaced as this init's result.
    pub fn init(&self, threshold: usize, cyclic: bool) -> Result<()> {
        if threshold == 0 {
            return Err(Error::InvalidArgument);
        }
        let mutex = Mutex::new();
        mutex.init()?;
        let cond = Cond::new();
        if let Err(e) = cond.init() {
            mutex.dispose();
            return Err(e);
        }
        self.slot.install(Arc::new(BarrierBacking {
            mutex,
            cond,
            threshold,
            cyclic,
            count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Rendezvous with the current cohort; blocks until `threshold` parties
    /// have arrived.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle or when the
    /// barrier is destroyed while waiting.
    pub fn wait(&self) -> Result<()> {
        self.wait_inner(None)
    }

    /// Like [`Barrier::wait`] with a deadline measured from entry.
    ///
    /// Errors: `InvalidArgument`, `TimedOut`.
    pub fn wait_timeout(&self, timeout_ms: u64) -> Result<()> {
        self.wait_inner(Some(Instant::now() + Duration::from_millis(timeout_ms)))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<()> {
        let b = self.slot.get()?;
        if b.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument);
        }
        b.mutex.lock()?;

        let generation = b.generation.load(Ordering::Relaxed);
        let arrivals = b.count.load(Ordering::Relaxed) + 1;
        b.count.store(arrivals, Ordering::Relaxed);

        if arrivals == b.threshold {
            b.generation.store(generation + 1, Ordering::Relaxed);
            b.count.store(0, Ordering::Relaxed);
            if let Err(e) = b.cond.broadcast() {
                let _ = b.mutex.unlock();
                return Err(e);
            }
            b.mutex.unlock()?;
            return Ok(());
        }

        while b.generation.load(Ordering::Relaxed) == generation
            && !b.destroyed.load(Ordering::Relaxed)
        {
            let waited = match deadline {
                None => b.cond.wait(&b.mutex),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        b.mutex.unlock()?;
                        return Err(Error::TimedOut);
                    }
                    let budget = deadline.duration_since(now).as_millis() as u64;
                    b.cond.wait_timeout(&b.mutex, budget.max(1))
                }
            };
            match waited {
                Ok(()) => {}
                Err(Error::TimedOut) => {
                    b.mutex.unlock()?;
                    return Err(Error::TimedOut);
                }
                // The condition variable was torn down underneath us.
                Err(_) => return Err(Error::InvalidArgument),
            }
        }

        if b.destroyed.load(Ordering::Relaxed) {
            let _ = b.mutex.unlock();
            return Err(Error::InvalidArgument);
        }
        b.mutex.unlock()?;
        Ok(())
    }

    /// Cyclic barriers only: advance the generation, zero the count, release
    /// any in-flight waiters (they return success). Ignored on one-shot
    /// barriers.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle.
    pub fn reset(&self) -> Result<()> {
        let b = self.slot.get()?;
        if !b.cyclic {
            return Ok(());
        }
        b.mutex.lock()?;
        b.generation
            .store(b.generation.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        b.count.store(0, Ordering::Relaxed);
        if let Err(e) = b.cond.broadcast() {
            let _ = b.mutex.unlock();
            return Err(e);
        }
        b.mutex.unlock()?;
        Ok(())
    }

    /// Tear down the barrier: wakes all waiters (they return
    /// `InvalidArgument`), then disposes the embedded condition variable and
    /// mutex in that order. Idempotent.
    pub fn destroy(&self) {
        let Some(b) = self.slot.take() else {
            return;
        };
        if b.mutex.lock().is_ok() {
            b.destroyed.store(true, Ordering::Release);
            let _ = b.cond.broadcast();
            let _ = b.mutex.unlock();
        } else {
            b.destroyed.store(true, Ordering::Release);
        }
        b.cond.dispose();
        b.mutex.dispose();
    }

    /// Number of cohorts released so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.slot
            .get()
            .map(|b| b.generation.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether the barrier reuses itself after each release.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        self.slot.get().map(|b| b.cyclic).unwrap_or(false)
    }

    /// Whether the handle is currently initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.slot.is_initialized()
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("initialized", &self.is_initialized())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threshold_is_rejected() {
        let b = Barrier::new();
        assert_eq!(b.init(0, false), Err(Error::InvalidArgument));
        assert!(!b.is_initialized());
    }

    #[test]
    fn threshold_one_never_blocks() {
        let b = Barrier::new();
        b.init(1, true).unwrap();
        for _ in 0..3 {
            b.wait().unwrap();
        }
        assert_eq!(b.generation(), 3);
        b.destroy();
    }

    #[test]
    fn one_shot_releases_full_cohort() {
        let b = Arc::new(Barrier::new());
        b.init(3, false).unwrap();

        let mut threads = Vec::new();
        for _ in 0..3 {
            let b = Arc::clone(&b);
            threads.push(std::thread::spawn(move || b.wait()));
        }
        for t in threads {
            assert_eq!(t.join().unwrap(), Ok(()));
        }
        assert_eq!(b.generation(), 1);
        b.destroy();
    }

    #[test]
    fn wait_timeout_expires_without_full_cohort() {
        let b = Barrier::new();
        b.init(2, true).unwrap();
        assert_eq!(b.wait_timeout(10), Err(Error::TimedOut));
        b.destroy();
    }

    #[test]
    fn reset_releases_in_flight_waiters_with_success() {
        let b = Arc::new(Barrier::new());
        b.init(2, true).unwrap();

        let b2 = Arc::clone(&b);
        let waiter = std::thread::spawn(move || b2.wait());
        // Give the waiter time to park.
        std::thread::sleep(Duration::from_millis(20));
        b.reset().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        b.destroy();
    }

    #[test]
    fn reset_is_ignored_on_one_shot() {
        let b = Barrier::new();
        b.init(2, false).unwrap();
        b.reset().unwrap();
        assert_eq!(b.generation(), 0);
        b.destroy();
    }

    #[test]
    fn destroy_wakes_waiters_with_invalid() {
        let b = Arc::new(Barrier::new());
        b.init(2, false).unwrap();

        let b2 = Arc::clone(&b);
        let waiter = std::thread::spawn(move || b2.wait());
        std::thread::sleep(Duration::from_millis(20));
        b.destroy();
        assert_eq!(waiter.join().unwrap(), Err(Error::InvalidArgument));
    }

    #[test]
    fn destroy_is_idempotent_and_reinit_valid() {
        let b = Barrier::new();
        b.init(1, false).unwrap();
        b.destroy();
        b.destroy();
        b.init(1, false).unwrap();
        b.wait().unwrap();
        b.destroy();
    }
}
