//! Unified error taxonomy.
//!
//! Every component reports failures from the same kind space so that callers
//! can match on one enum regardless of which primitive produced the error.
//! Kinds fall into four families:
//!
//! - usage errors (caller bug, never retried): [`Error::InvalidArgument`],
//!   [`Error::Busy`], [`Error::NotPermitted`], [`Error::NotStarted`],
//!   [`Error::Detached`], [`Error::AlreadyFinished`]
//! - resource errors (caller may retry): [`Error::ResourceExhausted`]
//! - expected control flow: [`Error::TimedOut`], [`Error::Cancelled`]
//! - environmental: [`Error::Internal`], [`Error::Unsupported`]

use thiserror::Error;

/// Error kind shared by all components.
///
/// Operations document the subset of kinds they may return. Use of an
/// uninitialized or disposed handle surfaces as [`Error::InvalidArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required argument was absent or out of range, or the handle was not
    /// initialized.
    #[error("invalid argument or uninitialized handle")]
    InvalidArgument,

    /// The handle is in the wrong state for this operation, or a non-blocking
    /// acquire found the resource held.
    #[error("resource busy or wrong state")]
    Busy,

    /// Backing resources (thread slots, allocations, ledger capacity) could
    /// not be obtained.
    #[error("backing resources exhausted")]
    ResourceExhausted,

    /// The calling context does not own the resource it tried to release.
    #[error("operation not permitted for this caller")]
    NotPermitted,

    /// The platform backend failed in a way the caller cannot remedy.
    #[error("internal backend failure")]
    Internal,

    /// A bounded wait reached its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// Acquiring would deadlock the calling thread on itself.
    #[error("deadlock detected")]
    Deadlock,

    /// The target was never started.
    #[error("thread not started")]
    NotStarted,

    /// The target already ran to completion and was consumed.
    #[error("already finished")]
    AlreadyFinished,

    /// The target was detached (or its join was already consumed).
    #[error("thread detached")]
    Detached,

    /// The operation was refused because shutdown is underway.
    #[error("cancelled by shutdown")]
    Cancelled,

    /// The backend cannot provide the requested behavior.
    #[error("unsupported by this backend")]
    Unsupported,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
