//! Blocking synchronization primitives.
//!
//! Three interlocking components: [`Mutex`] (mutual exclusion), [`Cond`]
//! (condition variables paired with a mutex), and [`Barrier`] (N-party
//! rendezvous built from the other two).
//!
//! All handles are caller-owned and operate through `&self`; the backing
//! objects are heap-allocated on `init` and released on `dispose`. Dispose is
//! idempotent, and a disposed handle may be re-initialized.

pub mod barrier;
pub mod cond;
#[allow(unsafe_code)]
pub mod mutex;

pub use barrier::Barrier;
pub use cond::Cond;
pub use mutex::{Mutex, MutexKind, TryAcquire};

use std::sync::Arc;

use crate::error::{Error, Result};

/// Handle slot: the init/dispose lifecycle shared by every sync component.
///
/// Holds the heap-allocated backing behind a small lock. Operations clone the
/// `Arc` out of the slot so a concurrent `dispose` cannot free the backing
/// out from under a caller already inside an operation (the caller contract
/// still forbids disposing a primitive that is in active use; the slot only
/// guarantees memory safety, not sensible semantics).
pub(crate) struct Slot<T> {
    inner: parking_lot::Mutex<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    pub(crate) const fn empty() -> Self {
        Self {
            inner: parking_lot::Mutex::new(None),
        }
    }

    /// Install a fresh backing. Fails with `Busy` if already initialized.
    pub(crate) fn install(&self, backing: Arc<T>) -> Result<()> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            return Err(Error::Busy);
        }
        *slot = Some(backing);
        Ok(())
    }

    /// Borrow the backing, or `InvalidArgument` on an uninitialized handle.
    pub(crate) fn get(&self) -> Result<Arc<T>> {
        self.inner.lock().clone().ok_or(Error::InvalidArgument)
    }

    /// Remove the backing. `None` if the handle was never initialized, which
    /// makes dispose idempotent.
    pub(crate) fn take(&self) -> Option<Arc<T>> {
        self.inner.lock().take()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}
