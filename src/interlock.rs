//! The load interlock.
//!
//! [`Interlock`] names the ways an application uses a [`ShareLock`] to keep
//! code loading apart from code unloading:
//!
//! - request handling and other application code runs inside [`Interlock::running`];
//! - code is loaded inside [`Interlock::loading`];
//! - a reload runs inside [`Interlock::unloading`], which waits until nobody
//!   is running or loading;
//! - a thread about to wait on another thread that may need to load code
//!   wraps that wait in [`Interlock::permit_concurrent_loads`].

use crate::config::Config;
use crate::error::Result;
use crate::lock::ShareLock;
use crate::purpose::{Compatibility, LOAD, UNLOAD};
use crate::snapshot::LockSnapshot;

/// Coordinates running, loading and unloading.
#[derive(Default)]
pub struct Interlock {
	lock: ShareLock,
}

impl Interlock {
	pub fn new() -> Interlock {
		Interlock::default()
	}

	pub fn with_config(config: Config) -> Interlock {
		Interlock {
			lock: ShareLock::with_config(config),
		}
	}

	/// Runs `op` while loading code.
	pub fn loading<R>(&self, op: impl FnOnce() -> R) -> R {
		self.lock.sharing(Some(LOAD), op)
	}

	/// Runs `op` with exclusive access for unloading code, once every
	/// running and loading thread has left.
	pub fn unloading<R>(&self, op: impl FnOnce() -> R) -> Result<R> {
		self.lock.exclusively(Some(UNLOAD), Compatibility::none(), op)
	}

	/// Starts unloading without a scope. Pair with [`Interlock::done_unloading`].
	pub fn start_unloading(&self) -> Result<()> {
		self.lock.start_exclusive(Some(UNLOAD), Compatibility::none())
	}

	pub fn done_unloading(&self) -> Result<()> {
		self.lock.stop_exclusive()
	}

	/// Runs application code in `op`.
	pub fn running<R>(&self, op: impl FnOnce() -> R) -> R {
		self.lock.sharing(None, op)
	}

	/// Starts running without a scope. Pair with [`Interlock::done_running`].
	pub fn start_running(&self) {
		self.lock.start_sharing(None)
	}

	pub fn done_running(&self) -> Result<()> {
		self.lock.stop_sharing()
	}

	/// Parks the calling thread's shares while `op` runs, so other threads
	/// can load code, or start running, in the meantime.
	pub fn permit_concurrent_loads<R>(&self, op: impl FnOnce() -> R) -> R {
		self.lock.yield_shares(None, Compatibility::of(&[LOAD]), false, op)
	}

	/// See [`ShareLock::raw_state`].
	pub fn raw_state<R>(&self, f: impl FnOnce(&LockSnapshot) -> R) -> R {
		self.lock.raw_state(f)
	}

	pub fn snapshot(&self) -> LockSnapshot {
		self.lock.snapshot()
	}

	/// The underlying lock.
	pub fn lock(&self) -> &ShareLock {
		&self.lock
	}
}
