//! Cooperative fibers.
//!
//! Fibers form a per-OS-thread group: [`Fiber::convert_main`] adopts the
//! calling OS thread as the group's main fiber, after which additional
//! fibers may be created and switched between. Exactly one fiber in a group
//! is current at any instant; control moves only by explicit
//! [`Fiber::switch_to`] calls, and a fiber whose entry returns transfers
//! control to the fiber that most recently resumed it (falling back to the
//! group's main fiber).
//!
//! Backend: each fiber context is a dedicated carrier with its own stack of
//! the requested size (default 64 KiB). Transfer of control is a strict
//! handoff (the resumer parks itself after making the target runnable), so
//! the group behaves as a single logical thread of control. Calls from an OS
//! thread outside the group are rejected with `NotPermitted`, which enforces
//! the contract that a fiber never migrates between OS threads.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::Builder;

use parking_lot::{Condvar, Mutex as StateLock};

use crate::error::{Error, Result};

/// Default stack size for a new fiber.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack the backend will provision.
const MIN_STACK_SIZE: usize = 16 * 1024;

struct FiberGroup {
    /// The fiber whose context is executing right now.
    current: StateLock<Weak<FiberShared>>,
    /// The group's main fiber: fallback transfer target for a finishing
    /// fiber whose resumer is gone.
    main: StateLock<Weak<FiberShared>>,
}

#[derive(Default)]
struct CarrierState {
    /// Set by a switch to hand control to this context.
    runnable: bool,
    /// Set by dispose to retire a never-resumed context.
    retired: bool,
}

struct FiberShared {
    state: StateLock<CarrierState>,
    cv: Condvar,
    /// Who resumed this fiber most recently; the finish trampoline returns
    /// control here.
    link: StateLock<Weak<FiberShared>>,
    started: AtomicBool,
    finished: AtomicBool,
    is_main: bool,
}

impl FiberShared {
    fn fresh(is_main: bool) -> Self {
        Self {
            state: StateLock::new(CarrierState::default()),
            cv: Condvar::new(),
            link: StateLock::new(Weak::new()),
            started: AtomicBool::new(is_main),
            finished: AtomicBool::new(false),
            is_main,
        }
    }

    /// Make this context runnable and wake its carrier.
    fn wake(&self) {
        let mut st = self.state.lock();
        st.runnable = true;
        self.cv.notify_one();
    }

    /// Park the calling carrier until a transfer token arrives, then consume
    /// it. The token may already be present (a wake can land before the
    /// carrier first parks). Returns false if retired instead.
    fn park(&self) -> bool {
        let mut st = self.state.lock();
        while !st.runnable && !st.retired {
            self.cv.wait(&mut st);
        }
        if st.retired {
            return false;
        }
        st.runnable = false;
        true
    }
}

thread_local! {
    /// (group, fiber hosted by this physical thread): the group membership
    /// and identity of whatever fiber context is executing here.
    static HOSTED: RefCell<Option<(Arc<FiberGroup>, Arc<FiberShared>)>> =
        const { RefCell::new(None) };
}

fn hosted() -> Option<(Arc<FiberGroup>, Arc<FiberShared>)> {
    HOSTED.with(|h| h.borrow().clone())
}

/// Handle to one fiber. `Send + Sync` so entries can capture handles of the
/// fibers they switch to; all operations are still rejected outside the
/// owning group's OS thread family.
pub struct Fiber {
    shared: Arc<FiberShared>,
    group: Arc<FiberGroup>,
    carrier: StateLock<Option<std::thread::JoinHandle<()>>>,
}

impl Fiber {
    /// Adopt the calling OS thread as a fiber group's main fiber. One-time
    /// per OS thread; the main fiber must exist before any other fiber is
    /// created from that thread.
    ///
    /// Errors: `Busy` if this OS thread already belongs to a group.
    pub fn convert_main() -> Result<Self> {
        if hosted().is_some() {
            return Err(Error::Busy);
        }
        let group = Arc::new(FiberGroup {
            current: StateLock::new(Weak::new()),
            main: StateLock::new(Weak::new()),
        });
        let shared = Arc::new(FiberShared::fresh(true));
        *group.current.lock() = Arc::downgrade(&shared);
        *group.main.lock() = Arc::downgrade(&shared);
        HOSTED.with(|h| {
            *h.borrow_mut() = Some((Arc::clone(&group), Arc::clone(&shared)));
        });
        Ok(Self {
            shared,
            group,
            carrier: StateLock::new(None),
        })
    }

    /// Create a fiber with the default stack size.
    pub fn new<F>(entry: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(entry, DEFAULT_STACK_SIZE)
    }

    /// Create a fiber whose context gets a stack of `stack_size` bytes
    /// (clamped to the backend minimum). The entry runs on first resume; when
    /// it returns, the trampoline marks the fiber finished and transfers
    /// control to the link.
    ///
    /// Errors: `NotStarted` when the calling OS thread has no main fiber
    /// established, `ResourceExhausted` when the context cannot be created.
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some((group, _)) = hosted() else {
            return Err(Error::NotStarted);
        };
        let shared = Arc::new(FiberShared::fresh(false));

        let carrier_group = Arc::clone(&group);
        let carrier_shared = Arc::clone(&shared);
        let carrier = Builder::new()
            .stack_size(stack_size.max(MIN_STACK_SIZE))
            .spawn(move || {
                HOSTED.with(|h| {
                    *h.borrow_mut() =
                        Some((Arc::clone(&carrier_group), Arc::clone(&carrier_shared)));
                });
                // Wait for the first resume; retire quietly if disposed
                // before ever running.
                if !carrier_shared.park() {
                    return;
                }
                entry();
                carrier_shared.finished.store(true, Ordering::Release);

                // Return control to whoever resumed us last, falling back to
                // the group's main fiber. If both are gone, control is lost
                // for the group, but the finished mark above is already
                // visible.
                let next = {
                    let linked = carrier_shared.link.lock().upgrade();
                    linked.or_else(|| carrier_group.main.lock().upgrade())
                };
                if let Some(next) = next {
                    *carrier_group.current.lock() = Arc::downgrade(&next);
                    next.wake();
                }
            })
            .map_err(|_| Error::ResourceExhausted)?;

        Ok(Self {
            shared,
            group,
            carrier: StateLock::new(Some(carrier)),
        })
    }

    /// Transfer control to this fiber. Records the caller as the target's
    /// link, makes the target current, and suspends the caller; returns when
    /// some fiber switches back.
    ///
    /// Errors: `NotPermitted` from an OS thread outside the fiber's group,
    /// `AlreadyFinished` when the target's entry has returned.
    pub fn switch_to(&self) -> Result<()> {
        let Some((group, me)) = hosted() else {
            return Err(Error::NotPermitted);
        };
        if !Arc::ptr_eq(&group, &self.group) {
            return Err(Error::NotPermitted);
        }
        if self.shared.finished.load(Ordering::Acquire) {
            return Err(Error::AlreadyFinished);
        }
        if Arc::ptr_eq(&me, &self.shared) {
            // Switching to the running fiber is a no-op yield.
            return Ok(());
        }

        *self.shared.link.lock() = Arc::downgrade(&me);
        *group.current.lock() = Arc::downgrade(&self.shared);
        self.shared.started.store(true, Ordering::Release);
        self.shared.wake();
        me.park();
        Ok(())
    }

    /// Alias for [`Fiber::switch_to`]; both directions of a cooperative
    /// transfer are the same operation.
    pub fn resume(&self) -> Result<()> {
        self.switch_to()
    }

    /// Whether this fiber's entry has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Whether this is a group's main fiber.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.shared.is_main
    }

    /// Whether this fiber is the one executing right now on the calling
    /// context.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.group
            .current
            .lock()
            .upgrade()
            .is_some_and(|cur| Arc::ptr_eq(&cur, &self.shared))
    }

    /// Release the context of a finished or never-resumed fiber.
    ///
    /// Errors: `Busy` when the fiber is current or suspended mid-execution
    /// (its stack is still live).
    pub fn dispose(&self) -> Result<()> {
        if self.is_current() {
            return Err(Error::Busy);
        }
        if self.shared.is_main {
            return Ok(());
        }
        let started = self.shared.started.load(Ordering::Acquire);
        let finished = self.shared.finished.load(Ordering::Acquire);
        if started && !finished {
            return Err(Error::Busy);
        }
        if !started {
            let mut st = self.shared.state.lock();
            st.retired = true;
            self.shared.cv.notify_one();
            drop(st);
        }
        if let Some(carrier) = self.carrier.lock().take() {
            let _ = carrier.join();
        }
        Ok(())
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Reap contexts that can be reaped without blocking on live work; a
        // suspended mid-execution fiber keeps its carrier (documented leak,
        // same as dropping any suspended context).
        let started = self.shared.started.load(Ordering::Acquire);
        let finished = self.shared.finished.load(Ordering::Acquire);
        if !started {
            let mut st = self.shared.state.lock();
            st.retired = true;
            self.shared.cv.notify_one();
            drop(st);
        }
        if !started || finished {
            if let Some(carrier) = self.carrier.lock().take() {
                let _ = carrier.join();
            }
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("main", &self.shared.is_main)
            .field("started", &self.shared.started.load(Ordering::Relaxed))
            .field("finished", &self.shared.finished.load(Ordering::Relaxed))
            .finish()
    }
}
