//! Diagnostic snapshots of a [`crate::ShareLock`].
//!
//! A snapshot is taken atomically under the lock's mutex and never changes
//! the lock. For every thread the lock knows about it records the shares
//! held, any exclusive claim, any parked (yielded) shares, and, for threads
//! asleep in the wait queue, what they are waiting for and which thread is
//! currently in their way. That is enough to spot a wait cycle.

use std::collections::HashMap;
use std::fmt;

use crate::config::WaitPolicy;
use crate::lock::LockState;
use crate::purpose::{Compatibility, Purpose};
use crate::sync::ThreadId;

/// The predicate a sleeping thread waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitReason {
	/// Waiting for a share.
	StartSharing,
	/// Waiting for exclusive access.
	StartExclusive,
	/// Waiting to take back yielded shares.
	YieldShares,
	/// Waiting for shares admitted by a widened exclusive to drain.
	ExclusiveRestore,
}

impl WaitReason {
	/// The name of the waiting operation.
	pub fn name(&self) -> &'static str {
		match self {
			WaitReason::StartSharing => "start_sharing",
			WaitReason::StartExclusive => "start_exclusive",
			WaitReason::YieldShares => "yield_shares",
			WaitReason::ExclusiveRestore => "exclusive_restore",
		}
	}
}

impl fmt::Display for WaitReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Parked shares of a thread inside [`crate::ShareLock::yield_shares`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YieldState {
	/// The purpose the thread yields for.
	pub purpose: Option<Purpose>,
	/// Requests the parked shares no longer hold up.
	pub compatible: Compatibility,
}

/// A thread's exclusive claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExclusiveState {
	pub purpose: Option<Purpose>,
	pub compatible: Compatibility,
	/// Nesting depth; zero while pending.
	pub depth: usize,
	/// Whether the claim is still waiting to be granted.
	pub pending: bool,
}

/// What the lock knows about one thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadState {
	pub thread: ThreadId,
	/// Shares held, not counting parked ones.
	pub sharing: usize,
	pub exclusive: Option<ExclusiveState>,
	pub yielded: Option<YieldState>,
	/// The predicate the thread sleeps on, if it is asleep in the lock.
	pub sleeper: Option<WaitReason>,
	/// The thread currently in the way of a sleeping thread.
	pub blocked_on: Option<ThreadId>,
}

impl ThreadState {
	fn new(thread: ThreadId) -> ThreadState {
		ThreadState {
			thread,
			sharing: 0,
			exclusive: None,
			yielded: None,
			sleeper: None,
			blocked_on: None,
		}
	}

	/// Whether the thread is asleep in the lock's wait queue.
	pub fn is_blocked(&self) -> bool {
		self.sleeper.is_some()
	}
}

impl fmt::Display for ThreadState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}: sharing={}", self.thread, self.sharing)?;
		if let Some(ex) = &self.exclusive {
			let state = if ex.pending {
				"pending"
			} else {
				"held"
			};
			write!(f, " exclusive={state} depth={} compatible={}", ex.depth, ex.compatible)?;
			if let Some(purpose) = ex.purpose {
				write!(f, " purpose={purpose}")?;
			}
		}
		if let Some(yielded) = &self.yielded {
			write!(f, " yielded compatible={}", yielded.compatible)?;
			if let Some(purpose) = yielded.purpose {
				write!(f, " purpose={purpose}")?;
			}
		}
		if let Some(reason) = self.sleeper {
			write!(f, " waiting in {reason}")?;
			if let Some(blocker) = self.blocked_on {
				write!(f, " on {blocker:?}")?;
			}
		}
		Ok(())
	}
}

/// A point-in-time view of a lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockSnapshot {
	threads: HashMap<ThreadId, ThreadState>,
}

impl LockSnapshot {
	/// State of `thread`, if the lock knows about it.
	pub fn get(&self, thread: ThreadId) -> Option<&ThreadState> {
		self.threads.get(&thread)
	}

	/// All known threads, in no particular order.
	pub fn iter(&self) -> impl Iterator<Item = &ThreadState> {
		self.threads.values()
	}

	/// Threads asleep in the wait queue.
	pub fn blocked(&self) -> impl Iterator<Item = &ThreadState> {
		self.iter().filter(|t| t.is_blocked())
	}

	/// Number of threads asleep in the wait queue.
	pub fn sleeping_count(&self) -> usize {
		self.blocked().count()
	}

	pub fn len(&self) -> usize {
		self.threads.len()
	}

	pub fn is_empty(&self) -> bool {
		self.threads.is_empty()
	}

	/// Follows `blocked_on` from `start`, returning the threads visited in
	/// order. Stops at a thread that is not asleep in the lock, or just before
	/// revisiting one.
	///
	/// Only waits inside the lock are visible here. A thread blocked on
	/// something else, such as joining another thread, ends the path.
	pub fn wait_chain(&self, start: ThreadId) -> Vec<ThreadId> {
		let mut chain = vec![start];
		let mut current = start;
		while let Some(next) = self.get(current).and_then(|t| t.blocked_on) {
			if chain.contains(&next) {
				break;
			}
			chain.push(next);
			current = next;
		}
		chain
	}
}

impl fmt::Display for LockSnapshot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut lines: Vec<String> = self.threads.values().map(|t| t.to_string()).collect();
		lines.sort();
		for line in lines {
			writeln!(f, "{line}")?;
		}
		Ok(())
	}
}

impl LockState {
	pub(crate) fn snapshot(&self, policy: WaitPolicy) -> LockSnapshot {
		let mut threads: HashMap<ThreadId, ThreadState> = HashMap::new();

		for (thread, shares) in &self.sharing {
			threads.entry(*thread).or_insert_with(|| ThreadState::new(*thread)).sharing = shares.len();
		}
		for (thread, yielded) in &self.yielded {
			threads.entry(*thread).or_insert_with(|| ThreadState::new(*thread)).yielded = Some(yielded.clone());
		}
		for (thread, sleeper) in &self.sleeping {
			let state = threads.entry(*thread).or_insert_with(|| ThreadState::new(*thread));
			state.sleeper = Some(sleeper.reason);
			state.blocked_on = self.blocker(*thread, sleeper, policy);
		}
		if let Some(ex) = &self.exclusive {
			threads.entry(ex.thread).or_insert_with(|| ThreadState::new(ex.thread)).exclusive =
				Some(ExclusiveState {
					purpose: ex.purpose,
					compatible: ex.compatible.clone(),
					depth: ex.depth,
					pending: !ex.held,
				});
		}

		LockSnapshot {
			threads,
		}
	}
}
