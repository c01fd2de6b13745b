//! Blocking mutual-exclusion lock.
//!
//! A [`Mutex`] is a caller-owned handle over a heap-allocated backing lock
//! word. The handle tracks the owning thread so that misuse (unlock by a
//! non-owner, self-deadlock on a plain mutex) is reported instead of hanging.
//!
//! The try-acquire path never blocks; [`Mutex::lock_timeout`] builds a
//! bounded acquire on top of it by polling with a short sleep between
//! attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::RawMutex as RawLock;
use parking_lot::RawMutex;

use crate::error::{Error, Result};
use crate::sync::Slot;
use crate::thread::current_os_id;

/// Mutex flavor requested at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// Plain non-recursive mutex. Relocking from the owner reports
    /// [`Error::Deadlock`].
    #[default]
    Plain,
    /// Recursive mutex. Not provided by this backend; init reports
    /// [`Error::Unsupported`] rather than emulating it.
    Recursive,
}

/// Outcome of a non-blocking acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquire {
    /// The lock was taken; the caller now owns the mutex.
    Acquired,
    /// The lock is held elsewhere; nothing was acquired.
    Busy,
}

/// Sleep granularity for the polling timed acquire.
const ACQUIRE_POLL: Duration = Duration::from_millis(1);

struct MutexBacking {
    raw: RawMutex,
    /// Id of the owning thread, 0 when unheld. Written by the thread that
    /// acquires, cleared by the owner before the raw unlock.
    owner: AtomicU64,
}

/// Blocking mutual-exclusion lock handle.
///
/// Fresh handles are uninitialized; every operation other than `init` and
/// `dispose` reports [`Error::InvalidArgument`] until `init` succeeds.
pub struct Mutex {
    slot: Slot<MutexBacking>,
}

impl Mutex {
    /// Create a fresh, uninitialized handle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: Slot::empty(),
        }
    }

    /// Initialize with the default (plain) kind.
    ///
    /// Errors: `Busy` if already initialized.
    pub fn init(&self) -> Result<()> {
        self.init_with(MutexKind::Plain)
    }

    /// Initialize with an explicit kind.
    ///
    /// Errors: `Busy` if already initialized, `Unsupported` for
    /// [`MutexKind::Recursive`].
    pub fn init_with(&self, kind: MutexKind) -> Result<()> {
        if kind == MutexKind::Recursive {
            return Err(Error::Unsupported);
        }
        self.slot.install(Arc::new(MutexBacking {
            raw: RawMutex::INIT,
            owner: AtomicU64::new(0),
        }))
    }

    /// Block until the mutex is acquired.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle, `Deadlock` when
    /// the calling thread already owns the lock.
    pub fn lock(&self) -> Result<()> {
        let backing = self.slot.get()?;
        let me = current_os_id();
        if backing.owner.load(Ordering::Acquire) == me {
            return Err(Error::Deadlock);
        }
        backing.raw.lock();
        backing.owner.store(me, Ordering::Release);
        Ok(())
    }

    /// Non-blocking acquire attempt. Never blocks, never spins.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle.
    pub fn try_lock(&self) -> Result<TryAcquire> {
        let backing = self.slot.get()?;
        if backing.raw.try_lock() {
            backing.owner.store(current_os_id(), Ordering::Release);
            Ok(TryAcquire::Acquired)
        } else {
            Ok(TryAcquire::Busy)
        }
    }

    /// Bounded acquire: poll [`Mutex::try_lock`] with a short sleep between
    /// attempts until acquired or the deadline (measured from entry) passes.
    ///
    /// Errors: `InvalidArgument`, `TimedOut`.
    pub fn lock_timeout(&self, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.try_lock()? == TryAcquire::Acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            std::thread::sleep(ACQUIRE_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Release the mutex.
    ///
    /// Errors: `InvalidArgument` on an uninitialized handle, `NotPermitted`
    /// when the calling thread is not the recorded owner.
    pub fn unlock(&self) -> Result<()> {
        let backing = self.slot.get()?;
        let me = current_os_id();
        backing
            .owner
            .compare_exchange(me, 0, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::NotPermitted)?;
        // SAFETY: the exchange above proves this thread acquired the raw lock
        // and nobody has released it since.
        unsafe { backing.raw.unlock() };
        Ok(())
    }

    /// Best-effort lock hint. Advisory only; the answer may be stale by the
    /// time the caller observes it.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.slot
            .get()
            .map(|b| b.raw.is_locked())
            .unwrap_or(false)
    }

    /// Whether the handle is currently initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.slot.is_initialized()
    }

    /// Release the backing. Idempotent; safe on a handle that was never
    /// initialized. The caller must not hold the lock.
    pub fn dispose(&self) {
        let _ = self.slot.take();
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("initialized", &self.is_initialized())
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn lifecycle_roundtrip_returns_to_fresh_state() {
        let m = Mutex::new();
        m.init().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.dispose();
        assert!(!m.is_initialized());
        assert_eq!(m.lock(), Err(Error::InvalidArgument));
    }

    #[test]
    fn reinit_after_dispose_is_valid() {
        let m = Mutex::new();
        m.init().unwrap();
        m.dispose();
        m.init().unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn double_init_is_busy() {
        let m = Mutex::new();
        m.init().unwrap();
        assert_eq!(m.init(), Err(Error::Busy));
        m.dispose();
    }

    #[test]
    fn double_dispose_is_noop() {
        let m = Mutex::new();
        m.init().unwrap();
        m.dispose();
        m.dispose();
        assert!(!m.is_initialized());
    }

    #[test]
    fn recursive_kind_is_reported_not_emulated() {
        let m = Mutex::new();
        assert_eq!(m.init_with(MutexKind::Recursive), Err(Error::Unsupported));
        assert!(!m.is_initialized());
    }

    #[test]
    fn try_lock_is_busy_while_held_elsewhere() {
        let m = Arc::new(Mutex::new());
        m.init().unwrap();
        m.lock().unwrap();

        let m2 = Arc::clone(&m);
        let observed_busy = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed_busy);
        let t = std::thread::spawn(move || {
            if m2.try_lock().unwrap() == TryAcquire::Busy {
                flag.store(true, Ordering::SeqCst);
            }
        });
        t.join().unwrap();
        assert!(observed_busy.load(Ordering::SeqCst));

        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn unlock_by_non_owner_is_not_permitted() {
        let m = Arc::new(Mutex::new());
        m.init().unwrap();
        m.lock().unwrap();

        let m2 = Arc::clone(&m);
        let t = std::thread::spawn(move || m2.unlock());
        assert_eq!(t.join().unwrap(), Err(Error::NotPermitted));

        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn self_relock_reports_deadlock() {
        let m = Mutex::new();
        m.init().unwrap();
        m.lock().unwrap();
        assert_eq!(m.lock(), Err(Error::Deadlock));
        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn lock_timeout_expires_while_held() {
        let m = Arc::new(Mutex::new());
        m.init().unwrap();
        m.lock().unwrap();

        let m2 = Arc::clone(&m);
        let t = std::thread::spawn(move || m2.lock_timeout(20));
        assert_eq!(t.join().unwrap(), Err(Error::TimedOut));

        m.unlock().unwrap();
        m.dispose();
    }

    #[test]
    fn lock_timeout_succeeds_once_released() {
        let m = Arc::new(Mutex::new());
        m.init().unwrap();
        m.lock().unwrap();

        let m2 = Arc::clone(&m);
        let t = std::thread::spawn(move || {
            let acquired = m2.lock_timeout(2_000);
            if acquired.is_ok() {
                m2.unlock().unwrap();
            }
            acquired
        });
        std::thread::sleep(Duration::from_millis(10));
        m.unlock().unwrap();
        assert_eq!(t.join().unwrap(), Ok(()));
        m.dispose();
    }
}
