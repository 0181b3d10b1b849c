//! Monitor-style waiting on top of a condition variable.
//!
//! A waiter holds the lock's mutex, checks its predicate against the full
//! state, and sleeps while the predicate says it is blocked. Every wake-up is
//! a broadcast and every waiter re-evaluates its predicate from scratch, so a
//! wake-up that was meant for someone else is harmless and none can be lost.

use std::time::Duration;

use crate::sync::{Condvar, MutexGuard};

pub(crate) struct WaitQueue {
	cv: Condvar,
}

impl WaitQueue {
	pub(crate) fn new() -> WaitQueue {
		WaitQueue {
			cv: Condvar::new(),
		}
	}

	/// Sleeps while `blocked` returns true, releasing the mutex while asleep.
	///
	/// With a `stall` threshold, `on_stall` is called once, with the mutex held,
	/// after waiting that long. Waiting continues afterwards.
	pub(crate) fn wait_while<T>(
		&self,
		guard: &mut MutexGuard<'_, T>,
		stall: Option<Duration>,
		mut blocked: impl FnMut(&T) -> bool,
		mut on_stall: impl FnMut(&T),
	) {
		let mut stall = stall;
		while blocked(&**guard) {
			match stall {
				Some(threshold) => {
					if self.cv.wait_for(guard, threshold).timed_out() && blocked(&**guard) {
						on_stall(&**guard);
						stall = None;
					}
				}
				None => self.cv.wait(guard),
			}
		}
	}

	/// Wakes every waiter so each re-checks its predicate.
	pub(crate) fn broadcast(&self) {
		self.cv.notify_all();
	}
}
