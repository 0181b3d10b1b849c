//! Synchronization primitives with loom support.
//!
//! Under normal compilation, re-exports from std/parking_lot.
//! Under `cfg(loom)`, uses loom's equivalents for deterministic testing.
//!
//! # Usage
//!
//! Instead of importing directly from `std::thread` or `parking_lot`,
//! import from this module:
//!
//! ```ignore
//! use crate::sync::{current_thread, Condvar, Mutex, MutexGuard, ThreadId};
//! ```
//!
//! # Loom Integration
//!
//! When compiled with `--cfg loom`, this module provides loom-compatible
//! implementations that allow deterministic testing of the wait/wake protocol
//! by exploring all possible thread interleavings.

// ===========================================================================
// Thread Identity
// ===========================================================================

#[cfg(not(loom))]
pub use std::thread::ThreadId;

#[cfg(loom)]
pub use loom::thread::ThreadId;

/// Returns the identity of the calling thread.
#[cfg(not(loom))]
#[inline]
pub fn current_thread() -> ThreadId {
	std::thread::current().id()
}

/// Returns the identity of the calling thread.
#[cfg(loom)]
#[inline]
pub fn current_thread() -> ThreadId {
	loom::thread::current().id()
}

// ===========================================================================
// Mutex and Condvar
// ===========================================================================

// Note: parking_lot's Condvar waits on `&mut MutexGuard` in place, while loom
// follows std and consumes the guard. The loom wrappers below present the
// parking_lot shape so the lock code is written once.

#[cfg(not(loom))]
pub use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

#[cfg(loom)]
mod loom_monitor {
	//! Wrapper types for loom's Mutex and Condvar to match parking_lot's API.

	use loom::sync::{Condvar as LoomCondvar, Mutex as LoomMutex, MutexGuard as LoomGuard};
	use std::time::Duration;

	/// A wrapper around loom's Mutex that provides a parking_lot-compatible API.
	pub struct Mutex<T>(LoomMutex<T>);

	impl<T> Mutex<T> {
		/// Creates a new Mutex.
		pub fn new(value: T) -> Self {
			Mutex(LoomMutex::new(value))
		}

		/// Acquires the mutex, blocking until available.
		pub fn lock(&self) -> MutexGuard<'_, T> {
			MutexGuard(Some(self.0.lock().unwrap()))
		}
	}

	/// Wrapper around loom's guard. The inner guard is only ever `None` while
	/// it is lent to the condition variable.
	pub struct MutexGuard<'a, T>(Option<LoomGuard<'a, T>>);

	impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
		type Target = T;
		fn deref(&self) -> &T {
			self.0.as_ref().unwrap()
		}
	}

	impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
		fn deref_mut(&mut self) -> &mut T {
			self.0.as_mut().unwrap()
		}
	}

	/// Result of a timed wait. Loom has no notion of time, so waits never time out.
	pub struct WaitTimeoutResult(bool);

	impl WaitTimeoutResult {
		/// Returns whether the wait ended because the timeout elapsed.
		pub fn timed_out(&self) -> bool {
			self.0
		}
	}

	/// A wrapper around loom's Condvar that provides a parking_lot-compatible API.
	pub struct Condvar(LoomCondvar);

	impl Condvar {
		/// Creates a new Condvar.
		pub fn new() -> Self {
			Condvar(LoomCondvar::new())
		}

		/// Blocks until notified, releasing the mutex while asleep.
		pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
			let inner = guard.0.take().unwrap();
			guard.0 = Some(self.0.wait(inner).unwrap());
		}

		/// Same as [`Condvar::wait`]; the timeout is ignored under loom.
		pub fn wait_for<T>(&self, guard: &mut MutexGuard<'_, T>, _timeout: Duration) -> WaitTimeoutResult {
			self.wait(guard);
			WaitTimeoutResult(false)
		}

		/// Wakes up all blocked threads.
		pub fn notify_all(&self) -> usize {
			self.0.notify_all();
			0
		}
	}
}

#[cfg(loom)]
pub use loom_monitor::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
