//! Implementation of a reentrant, upgradeable share lock.
//!
//! Threads take *shares* to run code that must not overlap with an exclusive
//! holder, and one thread at a time may take *exclusive* access, which waits
//! until every incompatible share has drained. Both kinds are reentrant:
//! a thread that already holds a share or the exclusive lock never blocks on
//! itself.
//!
//! A share holder that is about to wait on something else (typically another
//! thread) can park its shares with [`ShareLock::yield_shares`]. While parked,
//! its shares no longer count against requests the yield is compatible with,
//! and they are reinstated, exactly, once the wrapped operation returns or
//! unwinds.
//!
//! All state lives behind a single mutex. Blocking happens in one place, the
//! wait queue, and every blocked thread re-evaluates its predicate against the
//! complete state whenever any other thread changes it.

use smallvec::SmallVec;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::{debug, error, trace, warn};

use crate::config::{Config, WaitPolicy};
use crate::error::{Error, Result, Violation};
use crate::purpose::{Compatibility, Purpose, Request};
use crate::snapshot::{LockSnapshot, WaitReason, YieldState};
use crate::sync::{current_thread, Mutex, MutexGuard, ThreadId};
use crate::wait::WaitQueue;

/// Purposes of a thread's nested shares, outermost first.
pub(crate) type Shares = SmallVec<[Option<Purpose>; 4]>;

/// The outermost purpose characterises a thread's share.
fn outermost(shares: &Shares) -> Option<Purpose> {
	shares.first().copied().flatten()
}

/// The in-flight exclusive request, pending or granted.
#[derive(Debug)]
pub(crate) struct Exclusive {
	pub(crate) thread: ThreadId,
	pub(crate) purpose: Option<Purpose>,
	pub(crate) compatible: Compatibility,
	pub(crate) depth: usize,
	pub(crate) held: bool,
}

/// A thread asleep in the wait queue and what it is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Sleeper {
	pub(crate) reason: WaitReason,
	pub(crate) purpose: Option<Purpose>,
}

/// Everything guarded by the lock's mutex.
#[derive(Debug, Default)]
pub(crate) struct LockState {
	pub(crate) sharing: HashMap<ThreadId, Shares>,
	pub(crate) yielded: HashMap<ThreadId, YieldState>,
	pub(crate) sleeping: HashMap<ThreadId, Sleeper>,
	pub(crate) exclusive: Option<Exclusive>,
}

impl LockState {
	fn holds_share(&self, thread: ThreadId) -> bool {
		self.sharing.contains_key(&thread)
	}

	fn is_exclusive_holder(&self, thread: ThreadId) -> bool {
		matches!(&self.exclusive, Some(ex) if ex.held && ex.thread == thread)
	}

	fn held_exclusive_mut(&mut self, thread: ThreadId) -> Option<&mut Exclusive> {
		self.exclusive.as_mut().filter(|ex| ex.held && ex.thread == thread)
	}

	/// The thread standing in the way of `me`, if any.
	pub(crate) fn blocker(&self, me: ThreadId, sleeper: &Sleeper, policy: WaitPolicy) -> Option<ThreadId> {
		match sleeper.reason {
			WaitReason::StartSharing => self.sharing_blocker(me, sleeper.purpose, policy),
			WaitReason::StartExclusive => {
				self.share_blocker(me).or_else(|| self.yield_blocker(me, sleeper.purpose))
			}
			// Parked shares cannot come back while the claim is held.
			WaitReason::ExclusiveRestore => self.share_blocker(me),
			WaitReason::YieldShares => self.resume_blocker(me),
		}
	}

	fn sharing_blocker(&self, me: ThreadId, purpose: Option<Purpose>, policy: WaitPolicy) -> Option<ThreadId> {
		let request = Request::Share(purpose);
		// A thread inside its own yield only waits for a granted exclusive.
		let nested = self.yielded.contains_key(&me);

		if let Some(ex) = self.exclusive.as_ref().filter(|ex| ex.thread != me) {
			if !ex.compatible.allows(request) {
				if ex.held {
					return Some(ex.thread);
				}
				let defers = policy == WaitPolicy::DeferToYielded && self.claim_defers(ex, me, request);
				if !nested && !defers {
					return Some(ex.thread);
				}
			}
		}

		if nested {
			return None;
		}
		self.yielded
			.iter()
			.find(|(thread, yielded)| **thread != me && !yielded.compatible.allows(request))
			.map(|(thread, _)| *thread)
	}

	/// Whether a pending claim is itself stuck behind a yielded thread that
	/// admits `request`.
	fn claim_defers(&self, claim: &Exclusive, me: ThreadId, request: Request) -> bool {
		let claim_request = Request::Exclusive(claim.purpose);
		self.yielded.iter().any(|(thread, yielded)| {
			*thread != me
				&& *thread != claim.thread
				&& !yielded.compatible.allows(claim_request)
				&& yielded.compatible.allows(request)
		})
	}

	/// Another thread's share that the claim of `me` does not allow.
	fn share_blocker(&self, me: ThreadId) -> Option<ThreadId> {
		let compatible = match &self.exclusive {
			Some(ex) if ex.thread == me => &ex.compatible,
			_ => return None,
		};
		// Our own shares never count against us.
		self.sharing
			.iter()
			.find(|(thread, shares)| **thread != me && !compatible.allows(Request::Share(outermost(shares))))
			.map(|(thread, _)| *thread)
	}

	/// Another yielded thread refusing an exclusive request for `purpose`.
	fn yield_blocker(&self, me: ThreadId, purpose: Option<Purpose>) -> Option<ThreadId> {
		let request = Request::Exclusive(purpose);
		self.yielded
			.iter()
			.find(|(thread, yielded)| **thread != me && !yielded.compatible.allows(request))
			.map(|(thread, _)| *thread)
	}

	fn resume_blocker(&self, me: ThreadId) -> Option<ThreadId> {
		self.exclusive.as_ref().filter(|ex| ex.held && ex.thread != me).map(|ex| ex.thread)
	}

	/// Checks the structural invariants, describing the first one broken.
	fn check(&self) -> std::result::Result<(), String> {
		if let Some(thread) = self.sharing.iter().find(|(_, shares)| shares.is_empty()).map(|(t, _)| t) {
			return Err(format!("{thread:?} has an empty share entry"));
		}

		let Some(ex) = &self.exclusive else {
			return Ok(());
		};
		let sleeper = self.sleeping.get(&ex.thread).map(|s| s.reason);

		if !ex.held {
			if ex.depth != 0 {
				return Err(format!("pending exclusive of {:?} has depth {}", ex.thread, ex.depth));
			}
			if sleeper != Some(WaitReason::StartExclusive) {
				return Err(format!("pending exclusive of {:?} is not waiting", ex.thread));
			}
			return Ok(());
		}

		if ex.depth == 0 {
			return Err(format!("held exclusive of {:?} has depth 0", ex.thread));
		}
		// Shares admitted while compatibility was widened drain during restore.
		if sleeper == Some(WaitReason::ExclusiveRestore) {
			return Ok(());
		}
		for (thread, shares) in &self.sharing {
			if *thread != ex.thread && !ex.compatible.allows(Request::Share(outermost(shares))) {
				return Err(format!(
					"{thread:?} holds an incompatible share while {:?} holds the exclusive",
					ex.thread
				));
			}
		}
		Ok(())
	}
}

/// A reentrant, upgradeable reader/writer lock keyed by thread identity.
///
/// ```
/// use sharelock::{Compatibility, ShareLock, LOAD, UNLOAD};
///
/// let lock = ShareLock::new();
///
/// lock.sharing(Some(LOAD), || {
///     // Shares nest.
///     lock.sharing(None, || assert_eq!(lock.share_count(), 2));
/// });
///
/// let unloaded = lock.exclusively(Some(UNLOAD), Compatibility::none(), || "done");
/// assert_eq!(unloaded, Ok("done"));
/// ```
pub struct ShareLock {
	state: Mutex<LockState>,
	queue: WaitQueue,
	config: Config,
}

impl Default for ShareLock {
	fn default() -> Self {
		ShareLock::new()
	}
}

impl ShareLock {
	/// Creates an unlocked `ShareLock` with the default [`Config`].
	pub fn new() -> ShareLock {
		ShareLock::with_config(Config::default())
	}

	/// Creates an unlocked `ShareLock`.
	pub fn with_config(config: Config) -> ShareLock {
		ShareLock {
			state: Mutex::new(LockState::default()),
			queue: WaitQueue::new(),
			config,
		}
	}

	/// The configuration the lock was created with.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Takes a share, blocking until no incompatible exclusive request (granted
	/// or pending) and no incompatible yielded thread stands in the way.
	///
	/// Never blocks when the calling thread already holds a share or the
	/// exclusive lock.
	pub fn start_sharing(&self, purpose: Option<Purpose>) {
		let me = current_thread();
		let mut state = self.state.lock();
		if !(state.holds_share(me) || state.is_exclusive_holder(me)) {
			self.wait_for(
				&mut state,
				me,
				Sleeper {
					reason: WaitReason::StartSharing,
					purpose,
				},
			);
		}
		let shares = state.sharing.entry(me).or_default();
		shares.push(purpose);
		trace!(thread = ?me, ?purpose, depth = shares.len(), "share acquired");
	}

	/// Releases the calling thread's innermost share.
	pub fn stop_sharing(&self) -> Result<()> {
		let me = current_thread();
		let mut state = self.state.lock();
		let shares = state.sharing.get_mut(&me).ok_or(Violation::NoShareHeld)?;
		shares.pop();
		let depth = shares.len();
		if depth == 0 {
			state.sharing.remove(&me);
			self.queue.broadcast();
		}
		trace!(thread = ?me, depth, "share released");
		Ok(())
	}

	/// Takes the exclusive lock, blocking until no other thread holds a share
	/// whose purpose `compatible` does not list, and no yielded thread refuses
	/// `purpose`.
	///
	/// The calling thread's own shares are ignored, which makes this an
	/// upgrade when it holds any. Taking the lock again while holding it only
	/// increases the depth. Returns [`Error::ReentrantExclusive`] if another
	/// thread holds or awaits exclusive access.
	pub fn start_exclusive(&self, purpose: Option<Purpose>, compatible: Compatibility) -> Result<()> {
		let me = current_thread();
		let mut state = self.state.lock();
		if let Some(ex) = state.exclusive.as_mut() {
			if ex.held && ex.thread == me {
				ex.depth += 1;
				trace!(thread = ?me, depth = ex.depth, "exclusive re-entered");
				return Ok(());
			}
			return Err(Error::ReentrantExclusive {
				holder: ex.thread,
				pending: !ex.held,
			});
		}

		state.exclusive = Some(Exclusive {
			thread: me,
			purpose,
			compatible,
			depth: 0,
			held: false,
		});
		self.wait_for(
			&mut state,
			me,
			Sleeper {
				reason: WaitReason::StartExclusive,
				purpose,
			},
		);
		if let Some(ex) = state.exclusive.as_mut() {
			ex.held = true;
			ex.depth = 1;
		}
		debug!(thread = ?me, ?purpose, "exclusive acquired");
		Ok(())
	}

	/// Releases one level of the calling thread's exclusive lock, waking all
	/// waiters once the outermost level is released.
	pub fn stop_exclusive(&self) -> Result<()> {
		let me = current_thread();
		let mut state = self.state.lock();
		let ex = state.held_exclusive_mut(me).ok_or(Violation::NoExclusiveHeld)?;
		ex.depth -= 1;
		if ex.depth == 0 {
			state.exclusive = None;
			self.queue.broadcast();
			debug!(thread = ?me, "exclusive released");
		}
		Ok(())
	}

	/// Runs `op` while still holding the exclusive lock, but with its
	/// compatibility widened by `compatible`, so that matching shares may be
	/// taken by other threads in the meantime.
	///
	/// Afterwards the original compatibility is restored and the call waits
	/// until shares it no longer allows have been released. Restoration also
	/// happens if `op` panics.
	pub fn permit_while_exclusive<R>(&self, compatible: &Compatibility, op: impl FnOnce() -> R) -> Result<R> {
		let me = current_thread();
		let original = {
			let mut state = self.state.lock();
			let ex = state.held_exclusive_mut(me).ok_or(Violation::NoExclusiveHeld)?;
			let original = ex.compatible.clone();
			ex.compatible = original.union(compatible);
			debug!(thread = ?me, compatible = %ex.compatible, "exclusive widened");
			self.queue.broadcast();
			original
		};

		let _narrow = Narrow {
			lock: self,
			me,
			original: Some(original),
		};
		Ok(op())
	}

	/// Parks the calling thread's shares while `op` runs.
	///
	/// While parked, requests whose purpose is in `compatible` are no longer
	/// held up by this thread; unless `block_share` is set, fresh share
	/// requests of any purpose are let through as well. When nested in another
	/// yield, the outer yield's purpose and compatibility narrow this one.
	///
	/// When `op` returns or unwinds, the call waits for any exclusive holder
	/// that got in meanwhile and then reinstates exactly the shares it parked.
	/// A thread without shares simply runs `op`.
	pub fn yield_shares<R>(
		&self,
		purpose: Option<Purpose>,
		compatible: Compatibility,
		block_share: bool,
		op: impl FnOnce() -> R,
	) -> R {
		let me = current_thread();
		let parked = {
			let mut state = self.state.lock();
			let loose = state.sharing.remove(&me);
			let mut previous = None;
			if let Some(shares) = &loose {
				previous = state.yielded.get(&me).cloned();
				let mut purpose = purpose;
				let mut compatible = compatible;
				if let Some(outer) = &previous {
					if purpose != outer.purpose {
						purpose = None;
					}
					compatible = compatible.intersect(&outer.compatible);
				}
				if !block_share {
					compatible = compatible.with_shares();
				}
				debug!(thread = ?me, shares = shares.len(), %compatible, "shares yielded");
				state.yielded.insert(
					me,
					YieldState {
						purpose,
						compatible,
					},
				);
			}
			self.queue.broadcast();
			Parked {
				loose,
				previous,
			}
		};

		let _resume = Resume {
			lock: self,
			me,
			parked,
		};
		op()
	}

	/// Takes a share released when the returned guard is dropped.
	pub fn shared(&self, purpose: Option<Purpose>) -> SharedGuard<'_> {
		self.start_sharing(purpose);
		SharedGuard {
			lock: self,
			_thread: PhantomData,
		}
	}

	/// Takes the exclusive lock, released when the returned guard is dropped.
	pub fn exclusive(&self, purpose: Option<Purpose>, compatible: Compatibility) -> Result<ExclusiveGuard<'_>> {
		self.start_exclusive(purpose, compatible)?;
		Ok(ExclusiveGuard {
			lock: self,
			_thread: PhantomData,
		})
	}

	/// Runs `op` holding a share.
	pub fn sharing<R>(&self, purpose: Option<Purpose>, op: impl FnOnce() -> R) -> R {
		let _guard = self.shared(purpose);
		op()
	}

	/// Runs `op` holding the exclusive lock.
	pub fn exclusively<R>(
		&self,
		purpose: Option<Purpose>,
		compatible: Compatibility,
		op: impl FnOnce() -> R,
	) -> Result<R> {
		let _guard = self.exclusive(purpose, compatible)?;
		Ok(op())
	}

	/// Number of shares the calling thread holds. Parked shares are not counted.
	pub fn share_count(&self) -> usize {
		let me = current_thread();
		self.state.lock().sharing.get(&me).map_or(0, |shares| shares.len())
	}

	/// Calls `f` with a snapshot of the lock state, taken and inspected while
	/// the internal mutex is held.
	///
	/// Nothing can change while `f` runs, and nothing can acquire or release
	/// this lock either: `f` must not call back into it. Meant for diagnosing a
	/// lock that is already stuck.
	pub fn raw_state<R>(&self, f: impl FnOnce(&LockSnapshot) -> R) -> R {
		let state = self.state.lock();
		let snapshot = state.snapshot(self.config.policy);
		f(&snapshot)
	}

	/// A snapshot of the lock state.
	pub fn snapshot(&self) -> LockSnapshot {
		self.raw_state(|snapshot| snapshot.clone())
	}

	/// Panics if the lock state is inconsistent.
	pub fn assert_invariants(&self) {
		let state = self.state.lock();
		if let Err(problem) = state.check() {
			panic!("share lock invariant violated: {problem}\n{}", state.snapshot(self.config.policy));
		}
	}

	/// Sleeps until `sleeper` is no longer blocked. Must be called with the
	/// state locked.
	fn wait_for(&self, state: &mut MutexGuard<'_, LockState>, me: ThreadId, sleeper: Sleeper) {
		let policy = self.config.policy;
		let Some(blocker) = state.blocker(me, &sleeper, policy) else {
			return;
		};
		debug!(thread = ?me, reason = %sleeper.reason, blocked_on = ?blocker, "waiting");

		state.sleeping.insert(me, sleeper);
		self.queue.wait_while(
			state,
			self.config.stall_warning,
			|state| state.blocker(me, &sleeper, policy).is_some(),
			|state| {
				warn!(
					thread = ?me,
					reason = %sleeper.reason,
					blocked_on = ?state.blocker(me, &sleeper, policy),
					sleeping = state.sleeping.len(),
					"share lock wait is taking a long time"
				)
			},
		);
		state.sleeping.remove(&me);
		trace!(thread = ?me, reason = %sleeper.reason, "woke up");
	}
}

/// Shares parked by [`ShareLock::yield_shares`].
struct Parked {
	loose: Option<Shares>,
	previous: Option<YieldState>,
}

/// Reinstates parked shares when dropped.
struct Resume<'a> {
	lock: &'a ShareLock,
	me: ThreadId,
	parked: Parked,
}

impl Drop for Resume<'_> {
	fn drop(&mut self) {
		let Some(mut shares) = self.parked.loose.take() else {
			return;
		};
		let lock = self.lock;
		let me = self.me;
		let mut state = lock.state.lock();
		lock.wait_for(
			&mut state,
			me,
			Sleeper {
				reason: WaitReason::YieldShares,
				purpose: None,
			},
		);

		match self.parked.previous.take() {
			Some(outer) => {
				state.yielded.insert(me, outer);
			}
			None => {
				state.yielded.remove(&me);
			}
		}
		// Shares taken inside the yield and never released stay innermost.
		if let Some(inner) = state.sharing.remove(&me) {
			shares.extend(inner);
		}
		debug!(thread = ?me, shares = shares.len(), "shares resumed");
		state.sharing.insert(me, shares);
		lock.queue.broadcast();
	}
}

/// Restores the exclusive compatibility when dropped.
struct Narrow<'a> {
	lock: &'a ShareLock,
	me: ThreadId,
	original: Option<Compatibility>,
}

impl Drop for Narrow<'_> {
	fn drop(&mut self) {
		let Some(original) = self.original.take() else {
			return;
		};
		let lock = self.lock;
		let me = self.me;
		let mut state = lock.state.lock();
		// `op` may have released the exclusive lock altogether.
		let Some(ex) = state.held_exclusive_mut(me) else {
			return;
		};
		ex.compatible = original;
		let purpose = ex.purpose;
		debug!(thread = ?me, "exclusive narrowed");
		lock.wait_for(
			&mut state,
			me,
			Sleeper {
				reason: WaitReason::ExclusiveRestore,
				purpose,
			},
		);
	}
}

/// RAII structure used to release a share when dropped.
///
/// Shares belong to the thread that took them, so the guard cannot be sent
/// to another thread.
pub struct SharedGuard<'a> {
	lock: &'a ShareLock,
	_thread: PhantomData<*const ()>,
}

impl Drop for SharedGuard<'_> {
	fn drop(&mut self) {
		if let Err(err) = self.lock.stop_sharing() {
			error!(%err, "failed to release share");
		}
	}
}

/// RAII structure used to release one level of exclusive access when dropped.
pub struct ExclusiveGuard<'a> {
	lock: &'a ShareLock,
	_thread: PhantomData<*const ()>,
}

impl Drop for ExclusiveGuard<'_> {
	fn drop(&mut self) {
		if let Err(err) = self.lock.stop_exclusive() {
			error!(%err, "failed to release exclusive lock");
		}
	}
}
