//! # Error Types for the Share Lock
//!
//! Lock operations only fail when they are called in a way the lock cannot
//! honour. Neither kind of error is retried internally:
//!
//! - [`Error::ReentrantExclusive`] is a contention outcome: another thread
//!   already holds, or is waiting for, exclusive access. The caller decides
//!   whether to back off or give up.
//! - [`Error::Implementation`] is a caller bug: a release without a matching
//!   acquisition. It is never silently ignored.
//!
//! Blocking is not an error. A thread waiting for a share or for exclusive
//! access stays asleep until another thread changes the lock state.

use thiserror::Error;

use crate::sync::ThreadId;

/// Errors returned by [`crate::ShareLock`] and [`crate::Interlock`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// Only one exclusive request may be in flight at a time.
	///
	/// Returned by `start_exclusive` when a different thread already holds the
	/// exclusive lock (`pending == false`) or is blocked waiting for it
	/// (`pending == true`). The lock state is left untouched.
	#[error("exclusive access already {} by {holder:?}", claim_state(.pending))]
	ReentrantExclusive {
		/// The thread owning the in-flight exclusive request.
		holder: ThreadId,
		/// Whether that request is still waiting to be granted.
		pending: bool,
	},

	/// A lock invariant would have been broken by the call.
	#[error("lock invariant violated: {0}")]
	Implementation(#[from] Violation),
}

fn claim_state(pending: &bool) -> &'static str {
	if *pending {
		"requested"
	} else {
		"held"
	}
}

/// The invariant an [`Error::Implementation`] refers to.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
	/// `stop_sharing` was called by a thread that holds no share.
	#[error("stop_sharing called by a thread holding no share")]
	NoShareHeld,

	/// An exclusive-only operation was called by a thread that does not hold
	/// the exclusive lock.
	#[error("exclusive lock is not held by the calling thread")]
	NoExclusiveHeld,
}

/// A Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;
