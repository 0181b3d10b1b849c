//! # Deadlock Tests for the Share Lock
//!
//! This module contains tests specifically designed to detect wait cycles
//! between threads that nest shares, yield them, and request exclusive access:
//! - The nested load scenario: a share holder yields and joins a helper thread
//!   that needs a share, while a reload waits for exclusive access
//! - Exclusive requests that are compatible with a yielded holder
//! - Pending exclusive requests ahead of fresh shares
//!
//! ## Test Strategy
//!
//! Stuck threads never come back, so every scenario that is expected to finish
//! runs under a timeout. The one scenario expected to hang is inspected via the
//! lock's diagnostic snapshot instead, and its threads are left behind.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test deadlock_tests
//! ```

use parking_lot::{Condvar, Mutex};
use sharelock::{Compatibility, Config, Interlock, ShareLock, WaitPolicy, WaitReason, LOAD, UNLOAD};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// ===========================================================================
// Helpers
// ===========================================================================

/// Runs a closure with a timeout, panicking if the operation doesn't complete
/// within the specified duration.
///
/// This is the primary mechanism for detecting deadlocks in tests. If a test
/// hangs due to a deadlock, the timeout will trigger and fail the test with
/// a descriptive message.
fn run_with_timeout<F, R>(timeout: Duration, name: &str, f: F) -> R
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	let (tx, rx) = channel();
	let name = name.to_string();

	let handle = thread::spawn(move || {
		let result = f();
		let _ = tx.send(result);
	});

	match rx.recv_timeout(timeout) {
		Ok(result) => {
			handle.join().expect("Thread panicked");
			result
		}
		Err(RecvTimeoutError::Timeout) => {
			panic!("TIMEOUT: '{}' did not complete within {:?} - potential deadlock detected", name, timeout);
		}
		Err(RecvTimeoutError::Disconnected) => {
			handle.join().expect("Thread panicked without sending result");
			panic!("Thread terminated unexpectedly without completing");
		}
	}
}

/// Polls `condition` until it holds, panicking after `timeout`.
fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
	let start = Instant::now();
	while !condition() {
		if start.elapsed() > timeout {
			panic!("TIMEOUT: {} did not happen within {:?}", what, timeout);
		}
		thread::sleep(Duration::from_millis(5));
	}
}

/// A latch that opens once it has been counted down to zero.
struct CountDownLatch {
	count: Mutex<usize>,
	opened: Condvar,
}

impl CountDownLatch {
	fn new(count: usize) -> CountDownLatch {
		CountDownLatch {
			count: Mutex::new(count),
			opened: Condvar::new(),
		}
	}

	fn count_down(&self) {
		let mut count = self.count.lock();
		*count = count.saturating_sub(1);
		if *count == 0 {
			self.opened.notify_all();
		}
	}

	fn wait(&self) {
		let mut count = self.count.lock();
		while *count > 0 {
			self.opened.wait(&mut count);
		}
	}
}

// ===========================================================================
// Nested Load Scenario
// ===========================================================================

/// Threads of the nested load scenario.
struct NestedLoad {
	interlock: Arc<Interlock>,
	unloader: ThreadId,
	outer: ThreadId,
	inner: ThreadId,
	events: Arc<Mutex<Vec<&'static str>>>,
	finished: Arc<AtomicBool>,
}

/// Sets up the reload-during-nested-load scenario:
///
/// - the unloader waits for both other threads to be ready, then unloads;
/// - the outer thread runs application code, spawns the inner thread, and
///   joins it inside `permit_concurrent_loads`;
/// - the inner thread waits until the unloader is blocked, then runs and loads.
fn start_nested_load(config: Config) -> NestedLoad {
	let interlock = Arc::new(Interlock::with_config(config));
	let ready_for_unload = Arc::new(CountDownLatch::new(2));
	let events = Arc::new(Mutex::new(Vec::new()));
	let finished = Arc::new(AtomicBool::new(false));
	let (ids_tx, ids_rx) = channel();

	let unloader = {
		let interlock = Arc::clone(&interlock);
		let ready_for_unload = Arc::clone(&ready_for_unload);
		let events = Arc::clone(&events);
		thread::spawn(move || {
			ready_for_unload.wait();
			interlock.unloading(|| events.lock().push("unload")).unwrap();
		})
	};

	{
		let interlock = Arc::clone(&interlock);
		let events = Arc::clone(&events);
		let finished = Arc::clone(&finished);
		thread::spawn(move || {
			ids_tx.send(thread::current().id()).unwrap();
			interlock.running(|| {
				let inner = {
					let interlock = Arc::clone(&interlock);
					let ready_for_unload = Arc::clone(&ready_for_unload);
					let events = Arc::clone(&events);
					thread::spawn(move || {
						ready_for_unload.count_down();
						wait_until(Duration::from_secs(5), "unloader waiting", || {
							interlock.raw_state(|state| {
								state.iter().any(|t| t.exclusive.as_ref().is_some_and(|ex| ex.pending) && t.is_blocked())
							})
						});
						interlock.running(|| interlock.loading(|| events.lock().push("load")));
					})
				};
				ids_tx.send(inner.thread().id()).unwrap();

				interlock.permit_concurrent_loads(|| {
					ready_for_unload.count_down();
					inner.join().unwrap();
				});
			});
			finished.store(true, Ordering::SeqCst);
		});
	}

	let outer = ids_rx.recv().unwrap();
	let inner = ids_rx.recv().unwrap();

	NestedLoad {
		unloader: unloader.thread().id(),
		outer,
		inner,
		interlock,
		events,
		finished,
	}
}

/// Under the strict policy the scenario deadlocks: the unloader waits for the
/// yielded outer thread, the inner thread waits for the unloader, and the
/// outer thread waits (outside the lock) for the inner thread.
#[test]
fn strict_policy_reproduces_nested_load_deadlock() {
	let config = Config::new().policy(WaitPolicy::Strict).stall_warning(None);
	let scenario = start_nested_load(config);
	let interlock = &scenario.interlock;

	wait_until(Duration::from_secs(5), "the wait cycle", || {
		interlock.raw_state(|state| {
			let unloader = state.get(scenario.unloader);
			let inner = state.get(scenario.inner);
			unloader.is_some_and(|t| t.blocked_on == Some(scenario.outer))
				&& inner.is_some_and(|t| t.blocked_on == Some(scenario.unloader))
		})
	});

	// Give the threads a grace period; nothing may move.
	let before = interlock.snapshot();
	thread::sleep(Duration::from_millis(300));
	let after = interlock.snapshot();
	assert_eq!(before, after, "lock state changed:\n{before}\n{after}");

	let unloader = after.get(scenario.unloader).unwrap();
	assert_eq!(unloader.sleeper, Some(WaitReason::StartExclusive));
	assert!(unloader.exclusive.as_ref().is_some_and(|ex| ex.pending));

	let inner = after.get(scenario.inner).unwrap();
	assert_eq!(inner.sleeper, Some(WaitReason::StartSharing));
	assert_eq!(inner.sharing, 0);

	let outer = after.get(scenario.outer).unwrap();
	assert!(!outer.is_blocked(), "the outer thread waits on a join, not on the lock");
	assert_eq!(outer.sharing, 0);
	assert!(outer.yielded.as_ref().is_some_and(|y| y.compatible.contains(LOAD)));

	assert_eq!(after.wait_chain(scenario.inner), vec![scenario.inner, scenario.unloader, scenario.outer]);
	assert_eq!(after.sleeping_count(), 2);
	assert!(scenario.events.lock().is_empty());
	assert!(!scenario.finished.load(Ordering::SeqCst));
	// The three threads stay blocked until the test binary exits.
}

/// With the default policy the unloader stands aside for the inner thread,
/// and the whole scenario completes with the load before the unload.
#[test]
fn default_policy_completes_nested_load() {
	run_with_timeout(Duration::from_secs(10), "nested_load", || {
		let scenario = start_nested_load(Config::new());

		wait_until(Duration::from_secs(5), "the unload", || scenario.events.lock().len() == 2);
		wait_until(Duration::from_secs(5), "the outer thread", || scenario.finished.load(Ordering::SeqCst));

		assert_eq!(*scenario.events.lock(), vec!["load", "unload"]);
		wait_until(Duration::from_secs(5), "an idle lock", || scenario.interlock.snapshot().is_empty());
		scenario.interlock.lock().assert_invariants();
	});
}

// ===========================================================================
// Yielding and Exclusive Requests
// ===========================================================================

/// A holder that yields for `unload` lets an unload through, then waits for
/// it to finish before taking its share back.
#[test]
fn yield_lets_compatible_exclusive_through() {
	run_with_timeout(Duration::from_secs(10), "compatible_exclusive", || {
		let lock = Arc::new(ShareLock::new());
		let events = Arc::new(Mutex::new(Vec::new()));

		lock.sharing(None, || {
			lock.yield_shares(None, Compatibility::of(&[UNLOAD]), true, || {
				let unloader = {
					let lock = Arc::clone(&lock);
					let events = Arc::clone(&events);
					thread::spawn(move || {
						lock.exclusively(Some(UNLOAD), Compatibility::none(), || {
							events.lock().push("unload");
						})
						.unwrap();
					})
				};
				unloader.join().unwrap();
				events.lock().push("resume");
			});
			assert_eq!(lock.share_count(), 1);
		});

		assert_eq!(*events.lock(), vec!["unload", "resume"]);
		assert!(lock.snapshot().is_empty());
	});
}

/// A yielded holder refusing the exclusive purpose keeps the exclusive request
/// waiting until it resumes and releases.
#[test]
fn yield_refusing_exclusive_keeps_it_waiting() {
	run_with_timeout(Duration::from_secs(10), "refused_exclusive", || {
		let lock = Arc::new(ShareLock::new());
		let granted = Arc::new(AtomicBool::new(false));

		lock.start_sharing(None);
		let unloader = lock.yield_shares(None, Compatibility::of(&[LOAD]), false, || {
			let unloader = {
				let lock = Arc::clone(&lock);
				let granted = Arc::clone(&granted);
				thread::spawn(move || {
					lock.exclusively(Some(UNLOAD), Compatibility::none(), || {
						granted.store(true, Ordering::SeqCst);
					})
					.unwrap();
				})
			};
			wait_until(Duration::from_secs(5), "unloader waiting", || lock.snapshot().sleeping_count() == 1);
			thread::sleep(Duration::from_millis(50));
			assert!(!granted.load(Ordering::SeqCst));
			unloader
		});

		assert!(!granted.load(Ordering::SeqCst));
		lock.stop_sharing().unwrap();
		unloader.join().unwrap();
		assert!(granted.load(Ordering::SeqCst));
	});
}

/// Without a yielded thread in its way, a pending exclusive request still
/// goes ahead of fresh shares under the default policy.
#[test]
fn pending_exclusive_goes_before_fresh_shares() {
	run_with_timeout(Duration::from_secs(10), "pending_exclusive", || {
		let lock = Arc::new(ShareLock::new());
		let events = Arc::new(Mutex::new(Vec::new()));
		let (ids_tx, ids_rx) = channel();

		lock.start_sharing(None);

		let unloader = {
			let lock = Arc::clone(&lock);
			let events = Arc::clone(&events);
			let ids_tx = ids_tx.clone();
			thread::spawn(move || {
				ids_tx.send(thread::current().id()).unwrap();
				lock.exclusively(Some(UNLOAD), Compatibility::none(), || events.lock().push("unload")).unwrap();
			})
		};
		let unloader_id = ids_rx.recv().unwrap();
		wait_until(Duration::from_secs(5), "unloader waiting", || {
			lock.snapshot().get(unloader_id).is_some_and(|t| t.is_blocked())
		});

		let loader = {
			let lock = Arc::clone(&lock);
			let events = Arc::clone(&events);
			thread::spawn(move || {
				ids_tx.send(thread::current().id()).unwrap();
				lock.sharing(Some(LOAD), || events.lock().push("load"));
			})
		};
		let loader_id = ids_rx.recv().unwrap();
		wait_until(Duration::from_secs(5), "loader waiting", || {
			lock.snapshot().get(loader_id).is_some_and(|t| t.blocked_on == Some(unloader_id))
		});

		lock.stop_sharing().unwrap();
		unloader.join().unwrap();
		loader.join().unwrap();

		assert_eq!(*events.lock(), vec!["unload", "load"]);
	});
}

/// A thread loading inside its own `permit_concurrent_loads` only waits for a
/// granted exclusive, not for a pending one.
#[test]
fn nested_load_inside_permit_ignores_pending_exclusive() {
	let config = Config::new().policy(WaitPolicy::Strict);
	run_with_timeout(Duration::from_secs(10), "nested_permit", move || {
		let interlock = Arc::new(Interlock::with_config(config));

		interlock.running(|| {
			interlock.permit_concurrent_loads(|| {
				let unloader = {
					let interlock = Arc::clone(&interlock);
					thread::spawn(move || interlock.unloading(|| ()).unwrap())
				};
				wait_until(Duration::from_secs(5), "unloader waiting", || {
					interlock.snapshot().sleeping_count() == 1
				});

				interlock.loading(|| ());
				unloader
			})
		})
		.join()
		.unwrap();
	});
}

/// A thread that takes a share while an exclusive holder widens its
/// compatibility, then yields it, neither holds up the narrowing nor gets
/// stuck resuming.
#[test]
fn narrowing_ignores_shares_yielded_meanwhile() {
	run_with_timeout(Duration::from_secs(10), "narrow_after_yield", || {
		let lock = Arc::new(ShareLock::new());
		let events = Arc::new(Mutex::new(Vec::new()));
		let (admit_tx, admit_rx) = channel();
		let (ids_tx, ids_rx) = channel();

		let loader = {
			let lock = Arc::clone(&lock);
			let events = Arc::clone(&events);
			thread::spawn(move || {
				ids_tx.send(thread::current().id()).unwrap();
				admit_rx.recv().unwrap();
				lock.sharing(Some(LOAD), || {
					lock.yield_shares(None, Compatibility::of(&[LOAD]), false, || {
						thread::sleep(Duration::from_millis(200));
					});
					events.lock().push("resume");
				});
			})
		};
		let loader_id = ids_rx.recv().unwrap();

		lock.exclusively(Some(UNLOAD), Compatibility::none(), || {
			lock.permit_while_exclusive(&Compatibility::of(&[LOAD]), || {
				admit_tx.send(()).unwrap();
				wait_until(Duration::from_secs(5), "the loader yielding", || {
					lock.snapshot().get(loader_id).is_some_and(|t| t.yielded.is_some())
				});
			})
			.unwrap();
			events.lock().push("narrowed");
		})
		.unwrap();

		loader.join().unwrap();
		assert_eq!(*events.lock(), vec!["narrowed", "resume"]);
		assert!(lock.snapshot().is_empty());
		lock.assert_invariants();
	});
}
