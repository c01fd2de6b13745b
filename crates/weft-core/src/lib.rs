//! Portable, low-level concurrency toolkit.
//!
//! `weft` provides a small family of interlocking primitives for structuring
//! parallel work on top of OS kernel threads:
//!
//! - [`sync::Mutex`]: blocking mutual exclusion with non-blocking try-acquire
//! - [`sync::Cond`]: condition variables coupled to a [`sync::Mutex`]
//! - [`sync::Barrier`]: N-party rendezvous, one-shot or cyclic
//! - [`thread::Thread`]: preemptive OS threads with observable lifecycle
//! - [`pool::Pool`]: fixed worker count over a FIFO task queue
//! - [`fiber::Fiber`]: cooperative fibers with a per-OS-thread current pointer
//! - [`ghost::GhostEngine`]: deterministic speculative-step engine with an
//!   append-only ledger
//!
//! Every handle follows the same lifecycle contract: created fresh, armed by
//! `init` (or a spawning constructor), driven by its working operations, and
//! torn down by `dispose`/`destroy`/`shutdown`. Dispose is idempotent and safe
//! on a handle that was never initialized. All fallible operations return
//! [`Result`] with the unified [`Error`] taxonomy.
//!
//! The crate reads no configuration from the environment, files, or arguments,
//! and performs no logging; observability belongs to the callers.

#![deny(unsafe_code)]

pub mod error;
pub mod fiber;
pub mod ghost;
pub mod pool;
pub mod sync;
pub mod thread;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use ghost::{Candidate, GhostEngine, GhostId, LedgerEntry};
pub use pool::Pool;
pub use sync::{Barrier, Cond, Mutex, MutexKind, TryAcquire};
pub use thread::{Thread, ThreadCtx, ThreadState};
