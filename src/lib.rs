//! # Sharelock: A Reentrant, Upgradeable Share Lock
//!
//! This crate provides a reader/writer lock built for coordinating code that
//! *runs* or *loads* against code that *unloads* (for example a reloader that
//! swaps out application code), where threads routinely nest acquisitions and
//! wait on each other while holding them.
//!
//! ## Design Overview
//!
//! **Shares and exclusive access**: any number of threads may hold *shares*
//! at once. One thread at a time may hold *exclusive* access, granted once
//! every incompatible share has been released. Both are reentrant and keyed
//! by thread identity, so a thread never blocks on itself, and a share holder
//! may upgrade to exclusive access.
//!
//! **Purposes**: every acquisition may carry a [`Purpose`]. An exclusive
//! request lists the purposes it tolerates in a [`Compatibility`] set; shares
//! with those purposes may overlap with it. Purposes never order requests.
//!
//! **Yielding**: a share holder about to wait on another thread can park its
//! shares with [`ShareLock::yield_shares`], so the thread it waits on is not
//! held up by it. The shares are reinstated exactly, on every exit path.
//!
//! **One monitor**: all state sits behind a single mutex with a single
//! condition variable. Waiters re-check their whole predicate after every
//! broadcast wake-up.
//!
//! ```text
//!   running ──┐                         ┌── unloading
//!   loading ──┼──► ShareLock ◄──────────┤
//!   permit ───┘   (mutex + wait queue)  └── raw_state / snapshot
//!   concurrent
//!   loads
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use sharelock::Interlock;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let interlock = Arc::new(Interlock::new());
//!
//! interlock.running(|| {
//!     let helper = {
//!         let interlock = Arc::clone(&interlock);
//!         thread::spawn(move || interlock.loading(|| "loaded"))
//!     };
//!     // Park our share while we wait, so the helper is never stuck behind it.
//!     let loaded = interlock.permit_concurrent_loads(|| helper.join().unwrap());
//!     assert_eq!(loaded, "loaded");
//! });
//!
//! let reloaded = interlock.unloading(|| "reloaded").unwrap();
//! assert_eq!(reloaded, "reloaded");
//! ```
//!
//! ## Deadlock Avoidance
//!
//! With [`WaitPolicy::Strict`], three threads can wait on each other forever:
//! a share holder yields and joins a helper, the helper asks for a share, and
//! an exclusive request waits for the yielded holder, refusing the helper in
//! the meantime. The default [`WaitPolicy::DeferToYielded`] lets the helper
//! through because the exclusive request cannot progress before the yielded
//! holder does anyway. [`ShareLock::raw_state`] exposes who waits on whom.

pub mod config;
pub mod error;
pub mod interlock;
pub mod lock;
pub mod purpose;
pub mod snapshot;

mod sync;
mod wait;

pub use config::{Config, WaitPolicy};
pub use error::{Error, Result, Violation};
pub use interlock::Interlock;
pub use lock::{ExclusiveGuard, ShareLock, SharedGuard};
pub use purpose::{Compatibility, Purpose, LOAD, UNLOAD};
pub use snapshot::{ExclusiveState, LockSnapshot, ThreadState, WaitReason, YieldState};
