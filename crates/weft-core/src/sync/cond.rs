//! Condition variable paired with a [`Mutex`].
//!
//! Wait choreography:
//!
//! 1. take the internal state lock
//! 2. bump the waiter count
//! 3. release the caller's mutex (still holding the state lock, so a signal
//!    issued between the release and the suspension cannot be lost)
//! 4. suspend until a wakeup permit is available
//! 5. consume the permit, drop the waiter count
//! 6. re-acquire the caller's mutex before returning
//!
//! The waiter count is advisory and is maintained on every exit path:
//! normal wakeup, timeout, and error alike.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex as StateLock};

use crate::error::{Error, Result};
use crate::sync::{Mutex, Slot};

#[derive(Default)]
struct CondState {
    /// Threads currently suspended in a wait.
    waiters: usize,
    /// Outstanding wakeup permits granted by signal/broadcast.
    permits: usize,
}

struct CondBacking {
    state: StateLock<CondState>,
    cv: Condvar,
}

/// Condition variable handle.
///
/// Waiting requires ownership of the paired [`Mutex`]; wakeups may also be
/// spurious at the platform's discretion, so callers re-check their predicate
/// in a loop.
pub struct Cond {
    slot: Slot<CondBacking>,
}

impl Cond {
    /// Create a fresh, uninitialized handle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Slot::empty(),
        }
    }

    /// Initialize the backing. Errors: `Busy` if already initialized.
    pub fn init(&self) -> Result<()> {
        self.slot.install(Arc::new(CondBacking {
            state: StateLock::new(CondState::default()),
            cv: Condvar::new(),
        }))
    }

    /// Atomically release `mutex` and suspend until signalled; re-acquires
    /// `mutex` before returning.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle, `Internal` when
    /// the mutex release fails (e.g. the caller did not own it).
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        let backing = self.slot.get()?;
        let mut state = backing.state.lock();
        state.waiters += 1;
        if mutex.unlock().is_err() {
            state.waiters -= 1;
            return Err(Error::Internal);
        }
        while state.permits == 0 {
            backing.cv.wait(&mut state);
        }
        state.permits -= 1;
        state.waiters -= 1;
        drop(state);
        mutex.lock()
    }

    /// Like [`Cond::wait`] with a deadline measured from entry. The mutex is
    /// re-acquired on the timeout path as well.
    ///
    /// Errors: `InvalidArgument`, `Internal`, `TimedOut`.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let backing = self.slot.get()?;
        let mut state = backing.state.lock();
        state.waiters += 1;
        if mutex.unlock().is_err() {
            state.waiters -= 1;
            return Err(Error::Internal);
        }
        let timed_out = loop {
            if state.permits > 0 {
                state.permits -= 1;
                break false;
            }
            // wait_until restarts interrupted sleeps against the remaining
            // budget; only a true deadline pass reports timed_out.
            if backing.cv.wait_until(&mut state, deadline).timed_out() && state.permits == 0 {
                break true;
            }
        };
        state.waiters -= 1;
        drop(state);
        mutex.lock()?;
        if timed_out {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Wake at most one waiter. No effect when nobody is waiting.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle.
    pub fn signal(&self) -> Result<()> {
        let backing = self.slot.get()?;
        let mut state = backing.state.lock();
        if state.waiters > state.permits {
            state.permits += 1;
            backing.cv.notify_one();
        }
        Ok(())
    }

    /// Wake all current waiters; they re-contend for the paired mutex.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle.
    pub fn broadcast(&self) -> Result<()> {
        let backing = self.slot.get()?;
        let mut state = backing.state.lock();
        if state.waiters > state.permits {
            state.permits = state.waiters;
            backing.cv.notify_all();
        }
        Ok(())
    }

    /// Advisory count of threads currently inside a wait.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.slot
            .get()
            .map(|b| b.state.lock().waiters)
            .unwrap_or(0)
    }

    /// Whether the handle is currently initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.slot.is_initialized()
    }

    /// Release the backing. Idempotent; must not be called while any thread
    /// is waiting.
    pub fn dispose(&self) {
        let _ = self.slot.take();
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cond")
            .field("initialized", &self.is_initialized())
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair() -> (Arc<Mutex>, Arc<Cond>) {
        let m = Arc::new(Mutex::new());
        let c = Arc::new(Cond::new());
        m.init().unwrap();
        c.init().unwrap();
        (m, c)
    }

    #[test]
    fn wait_on_uninitialized_is_invalid() {
        let m = Mutex::new();
        m.init().unwrap();
        let c = Cond::new();
        m.lock().unwrap();
        assert_eq!(c.wait(&m), Err(Error::InvalidArgument));
        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn wait_without_mutex_ownership_is_internal() {
        let (m, c) = pair();
        // Mutex not locked by this thread: the internal release fails.
        assert_eq!(c.wait(&m), Err(Error::Internal));
        c.dispose();
        m.dispose();
    }

    #[test]
    fn signal_with_zero_waiters_has_no_effect() {
        let (m, c) = pair();
        c.signal().unwrap();
        c.signal().unwrap();
        // A subsequent timed wait must not consume a stale permit.
        m.lock().unwrap();
        assert_eq!(c.wait_timeout(&m, 10), Err(Error::TimedOut));
        m.unlock().unwrap();
        c.dispose();
        m.dispose();
    }

    #[test]
    fn timed_wait_reacquires_mutex_on_timeout() {
        let (m, c) = pair();
        m.lock().unwrap();
        assert_eq!(c.wait_timeout(&m, 5), Err(Error::TimedOut));
        // Mutex must be owned again: unlock succeeds.
        m.unlock().unwrap();
        c.dispose();
        m.dispose();
    }

    #[test]
    fn signal_wakes_exactly_one_waiter() {
        let (m, c) = pair();
        let woken = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..2 {
            let (m, c, woken) = (Arc::clone(&m), Arc::clone(&c), Arc::clone(&woken));
            threads.push(std::thread::spawn(move || {
                m.lock().unwrap();
                c.wait(&m).unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
                m.unlock().unwrap();
            }));
        }

        while c.waiter_count() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        c.signal().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        c.broadcast().unwrap();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 2);
        c.dispose();
        m.dispose();
    }

    #[test]
    fn waiter_count_drops_on_every_exit_path() {
        let (m, c) = pair();
        m.lock().unwrap();
        let _ = c.wait_timeout(&m, 5);
        m.unlock().unwrap();
        assert_eq!(c.waiter_count(), 0);
        c.dispose();
        m.dispose();
    }

    #[test]
    fn broadcast_wakes_all_waiters() {
        let (m, c) = pair();
        let woken = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let (m, c, woken) = (Arc::clone(&m), Arc::clone(&c), Arc::clone(&woken));
            threads.push(std::thread::spawn(move || {
                m.lock().unwrap();
                c.wait(&m).unwrap();
                woken.fetch_add(1, Ordering::SeqCst);
                m.unlock().unwrap();
            }));
        }

        while c.waiter_count() < 4 {
            std::thread::sleep(Duration::from_millis(1));
        }
        c.broadcast().unwrap();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 4);
        c.dispose();
        m.dispose();
    }
}
