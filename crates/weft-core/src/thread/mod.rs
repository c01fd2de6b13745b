//! Preemptive OS-thread lifecycle.
//!
//! A [`Thread`] handle tracks one OS thread through the state machine
//!
//! ```text
//! Fresh -> Started -> Finished -> Joined
//!             \-> Detached -> Finished
//! any state -> Disposed
//! ```
//!
//! Join and detach each succeed at most once and are mutually exclusive. The
//! spawned thread runs a trampoline that records the start timestamp, invokes
//! the user entry, stores its return value exactly once, then records the
//! finish timestamp and marks the handle finished.
//!
//! Cancellation is cooperative only: [`Thread::cancel`] raises a flag the
//! entry observes through its [`ThreadCtx`]; nothing is ever terminated
//! forcibly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::Builder;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SlotLock;

use crate::error::{Error, Result};

const STATE_FRESH: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_DETACHED: u8 = 2;
const STATE_JOINED: u8 = 4;
const STATE_DISPOSED: u8 = 5;

/// Observable lifecycle state of a [`Thread`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Created, not yet started.
    Fresh = 0,
    /// Running the user entry.
    Started = 1,
    /// Detached; teardown belongs to the runtime.
    Detached = 2,
    /// The entry returned; return value is stored.
    Finished = 3,
    /// Joined; return value was consumed.
    Joined = 4,
    /// Disposed; the handle may be reused by a new spawn.
    Disposed = 5,
}

struct ThreadShared {
    os_id: AtomicU64,
    cancel: AtomicBool,
    finished: AtomicBool,
    started_at: SlotLock<Option<Instant>>,
    finished_at: SlotLock<Option<Instant>>,
}

impl ThreadShared {
    fn fresh() -> Self {
        Self {
            os_id: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            started_at: SlotLock::new(None),
            finished_at: SlotLock::new(None),
        }
    }

    fn zero(&self) {
        self.os_id.store(0, Ordering::Release);
        self.cancel.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        *self.started_at.lock() = None;
        *self.finished_at.lock() = None;
    }
}

/// View of the owning handle passed to the running entry.
pub struct ThreadCtx {
    shared: Arc<ThreadShared>,
}

impl ThreadCtx {
    /// Whether a cooperative cancel was requested. The entry polls this at
    /// safe points; the engine never terminates a thread on its own.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }

    /// Process-local id of the thread running this entry.
    #[must_use]
    pub fn os_id(&self) -> u64 {
        self.shared.os_id.load(Ordering::Acquire)
    }
}

/// Handle to one OS thread; `T` is the entry's return type, transferred to
/// the caller by [`Thread::join`].
pub struct Thread<T> {
    shared: Arc<ThreadShared>,
    state: AtomicU8,
    join_handle: SlotLock<Option<std::thread::JoinHandle<()>>>,
    retval: Arc<SlotLock<Option<T>>>,
}

impl<T: Send + 'static> Thread<T> {
    /// Create a fresh handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ThreadShared::fresh()),
            state: AtomicU8::new(STATE_FRESH),
            join_handle: SlotLock::new(None),
            retval: Arc::new(SlotLock::new(None)),
        }
    }

    /// Start a new OS thread running `entry`.
    ///
    /// Errors: `Busy` unless the handle is Fresh (or Disposed and reusable),
    /// `ResourceExhausted` when the OS refuses the thread.
    pub fn spawn<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce(&ThreadCtx) -> T + Send + 'static,
    {
        // A disposed handle is reusable; everything else must be Fresh.
        if self
            .state
            .compare_exchange(
                STATE_DISPOSED,
                STATE_FRESH,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.shared.zero();
            *self.retval.lock() = None;
        }
        self.state
            .compare_exchange(
                STATE_FRESH,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::Busy)?;

        let shared = Arc::clone(&self.shared);
        let retval = Arc::clone(&self.retval);
        let spawned = Builder::new().spawn(move || {
            shared.os_id.store(current_os_id(), Ordering::Release);
            *shared.started_at.lock() = Some(Instant::now());
            let ctx = ThreadCtx {
                shared: Arc::clone(&shared),
            };
            let value = entry(&ctx);
            *retval.lock() = Some(value);
            *shared.finished_at.lock() = Some(Instant::now());
            shared.finished.store(true, Ordering::Release);
        });

        match spawned {
            Ok(handle) => {
                *self.join_handle.lock() = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.state.store(STATE_FRESH, Ordering::Release);
                Err(Error::ResourceExhausted)
            }
        }
    }

    /// Block until the thread finishes and transfer its return value.
    ///
    /// Join succeeds at most once. Errors: `NotStarted` on a Fresh handle,
    /// `Detached` after a detach or a prior join, `InvalidArgument` on a
    /// disposed handle, `Internal` when the backing join fails.
    pub fn join(&self) -> Result<T> {
        match self.state.load(Ordering::Acquire) {
            STATE_FRESH => return Err(Error::NotStarted),
            STATE_DETACHED => return Err(Error::Detached),
            STATE_JOINED => return Err(Error::Detached),
            STATE_DISPOSED => return Err(Error::InvalidArgument),
            _ => {}
        }
        // Exactly-once: whichever caller takes the backing handle wins.
        let handle = self.join_handle.lock().take().ok_or(Error::Detached)?;
        handle.join().map_err(|_| Error::Internal)?;
        self.state.store(STATE_JOINED, Ordering::Release);
        self.retval.lock().take().ok_or(Error::Internal)
    }

    /// Mark the thread non-joinable; OS-level teardown transfers to the
    /// runtime. Once-only, mutually exclusive with join.
    ///
    /// Errors: `NotStarted`, `Detached` (repeat detach), `AlreadyFinished`
    /// (detach after join), `InvalidArgument` (disposed handle).
    pub fn detach(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_FRESH => return Err(Error::NotStarted),
            STATE_DETACHED => return Err(Error::Detached),
            STATE_JOINED => return Err(Error::AlreadyFinished),
            STATE_DISPOSED => return Err(Error::InvalidArgument),
            _ => {}
        }
        let handle = self.join_handle.lock().take().ok_or(Error::Detached)?;
        drop(handle);
        self.state.store(STATE_DETACHED, Ordering::Release);
        Ok(())
    }

    /// Request cooperative cancellation. The running entry observes the flag
    /// through [`ThreadCtx::cancel_requested`].
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    /// Whether a cancel was requested on this handle.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel.load(Ordering::Acquire)
    }

    /// Observable lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        let finished = self.shared.finished.load(Ordering::Acquire);
        match self.state.load(Ordering::Acquire) {
            STATE_FRESH => ThreadState::Fresh,
            STATE_STARTED if finished => ThreadState::Finished,
            STATE_STARTED => ThreadState::Started,
            STATE_DETACHED if finished => ThreadState::Finished,
            STATE_DETACHED => ThreadState::Detached,
            STATE_JOINED => ThreadState::Joined,
            _ => ThreadState::Disposed,
        }
    }

    /// Process-local id of the backing thread; 0 before the trampoline runs
    /// or after dispose.
    #[must_use]
    pub fn os_id(&self) -> u64 {
        self.shared.os_id.load(Ordering::Acquire)
    }

    /// When the trampoline began executing the entry.
    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        *self.shared.started_at.lock()
    }

    /// When the entry returned.
    #[must_use]
    pub fn finished_at(&self) -> Option<Instant> {
        *self.shared.finished_at.lock()
    }

    /// True iff both handles refer to the same live OS thread. The identity
    /// of finished or disposed handles is undefined and reported as false.
    #[must_use]
    pub fn same_thread(&self, other: &Self) -> bool {
        let a = self.os_id();
        let b = other.os_id();
        a != 0
            && a == b
            && self.state() == ThreadState::Started
            && other.state() == ThreadState::Started
    }

    /// Release the handle.
    ///
    /// Safe on Fresh, Joined, and Detached-and-Finished handles. On a handle
    /// that is Started but neither joined nor finished, blocks until the
    /// entry returns (the backing thread is never leaked and the finished
    /// flag is always written before teardown). Idempotent.
    pub fn dispose(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_DISPOSED => return,
            STATE_FRESH | STATE_JOINED => {}
            _ => {
                if let Some(handle) = self.join_handle.lock().take() {
                    let _ = handle.join();
                } else {
                    // Detached (or a racing joiner holds the backing handle):
                    // wait for the trampoline's finished mark.
                    while !self.shared.finished.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        self.shared.zero();
        *self.retval.lock() = None;
        self.state.store(STATE_DISPOSED, Ordering::Release);
    }
}

impl<T: Send + 'static> Default for Thread<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Thread<T> {
    fn drop(&mut self) {
        // Never leak a running backing thread: joining here mirrors the
        // documented dispose contract.
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<T> std::fmt::Debug for Thread<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("os_id", &self.shared.os_id.load(Ordering::Relaxed))
            .field("raw_state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

static NEXT_OS_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OS_ID: u64 = NEXT_OS_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-local id of the calling thread. Nonzero, stable for the thread's
/// lifetime.
#[must_use]
pub fn current_os_id() -> u64 {
    OS_ID.with(|id| *id)
}

/// Hint the scheduler to run another thread.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Suspend the calling thread for at least `ms` milliseconds. Interrupted
/// sleeps are restarted by the backing runtime until the duration elapses.
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_transfers_return_value_exactly_once() {
        let t: Thread<u64> = Thread::new();
        t.spawn(|_| 42u64).unwrap();
        assert_eq!(t.join(), Ok(42));
        assert_eq!(t.join(), Err(Error::Detached));
        t.dispose();
    }

    #[test]
    fn join_before_spawn_is_not_started() {
        let t: Thread<()> = Thread::new();
        assert_eq!(t.join(), Err(Error::NotStarted));
        assert_eq!(t.detach(), Err(Error::NotStarted));
    }

    #[test]
    fn spawn_twice_is_busy() {
        let t: Thread<()> = Thread::new();
        t.spawn(|_| ()).unwrap();
        assert_eq!(t.spawn(|_| ()), Err(Error::Busy));
        t.join().unwrap();
        t.dispose();
    }

    #[test]
    fn detach_then_join_is_rejected() {
        let t: Thread<()> = Thread::new();
        t.spawn(|_| sleep_ms(5)).unwrap();
        t.detach().unwrap();
        assert_eq!(t.join(), Err(Error::Detached));
        assert_eq!(t.detach(), Err(Error::Detached));
        t.dispose();
    }

    #[test]
    fn join_then_detach_is_rejected() {
        let t: Thread<()> = Thread::new();
        t.spawn(|_| ()).unwrap();
        t.join().unwrap();
        assert_eq!(t.detach(), Err(Error::AlreadyFinished));
        t.dispose();
    }

    #[test]
    fn dispose_blocks_until_running_entry_finishes() {
        let t: Thread<()> = Thread::new();
        t.spawn(|_| sleep_ms(20)).unwrap();
        let before = Instant::now();
        t.dispose();
        assert!(before.elapsed() >= Duration::from_millis(15));
        assert_eq!(t.state(), ThreadState::Disposed);
        // Dispose is idempotent.
        t.dispose();
    }

    #[test]
    fn disposed_handle_is_reusable() {
        let t: Thread<u8> = Thread::new();
        t.spawn(|_| 1).unwrap();
        assert_eq!(t.join(), Ok(1));
        t.dispose();
        t.spawn(|_| 2).unwrap();
        assert_eq!(t.join(), Ok(2));
        t.dispose();
    }

    #[test]
    fn cooperative_cancel_is_observable_by_the_entry() {
        let t: Thread<u32> = Thread::new();
        t.spawn(|ctx| {
            let mut polls = 0u32;
            while !ctx.cancel_requested() {
                polls += 1;
                sleep_ms(1);
            }
            polls
        })
        .unwrap();
        sleep_ms(10);
        t.cancel();
        let polls = t.join().unwrap();
        assert!(polls > 0);
        t.dispose();
    }

    #[test]
    fn trampoline_records_timestamps_in_order() {
        let t: Thread<()> = Thread::new();
        t.spawn(|_| sleep_ms(5)).unwrap();
        t.join().unwrap();
        let started = t.started_at().unwrap();
        let finished = t.finished_at().unwrap();
        assert!(finished >= started);
        t.dispose();
    }

    #[test]
    fn state_tracks_lifecycle() {
        let t: Thread<()> = Thread::new();
        assert_eq!(t.state(), ThreadState::Fresh);
        t.spawn(|_| sleep_ms(10)).unwrap();
        assert_eq!(t.state(), ThreadState::Started);
        t.join().unwrap();
        assert_eq!(t.state(), ThreadState::Joined);
        t.dispose();
        assert_eq!(t.state(), ThreadState::Disposed);
    }

    #[test]
    fn os_ids_distinguish_live_threads() {
        let a: Thread<u64> = Thread::new();
        a.spawn(|ctx| {
            let id = ctx.os_id();
            sleep_ms(10);
            id
        })
        .unwrap();
        let main_id = current_os_id();
        let child_id = a.join().unwrap();
        assert_ne!(child_id, 0);
        assert_ne!(child_id, main_id);
        a.dispose();
    }
}
