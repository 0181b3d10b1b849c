//! Lock construction options.

use std::time::Duration;

/// How long a thread may sleep in the wait queue before a warning is logged.
pub const DEFAULT_STALL_WARNING: Duration = Duration::from_secs(5);

/// How a pending exclusive request treats fresh share requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitPolicy {
	/// A pending exclusive request blocks every fresh share it is not
	/// compatible with, even while it is itself stuck behind a thread that
	/// has yielded its shares.
	///
	/// Three threads can deadlock under this policy: a share holder yields
	/// and joins a helper thread, the helper requests a share, and an
	/// exclusive request waits on the yielded holder.
	Strict,

	/// A pending exclusive request that is obstructed by a yielded thread
	/// stands aside for the fresh shares that thread admits. The request
	/// goes ahead as soon as the yielded thread resumes and drains.
	#[default]
	DeferToYielded,
}

/// Options for a [`crate::ShareLock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
	/// Policy of pending exclusive requests towards fresh shares.
	pub policy: WaitPolicy,
	/// Log a warning when a wait lasts longer than this. `None` disables it.
	pub stall_warning: Option<Duration>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			policy: WaitPolicy::default(),
			stall_warning: Some(DEFAULT_STALL_WARNING),
		}
	}
}

impl Config {
	/// The default configuration.
	pub fn new() -> Config {
		Config::default()
	}

	/// Sets the wait policy.
	pub fn policy(mut self, policy: WaitPolicy) -> Config {
		self.policy = policy;
		self
	}

	/// Sets, or with `None` disables, the stall warning threshold.
	pub fn stall_warning(mut self, threshold: Option<Duration>) -> Config {
		self.stall_warning = threshold;
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let config = Config::new();
		assert_eq!(config.policy, WaitPolicy::DeferToYielded);
		assert_eq!(config.stall_warning, Some(DEFAULT_STALL_WARNING));
	}

	#[test]
	fn builder() {
		let config = Config::new().policy(WaitPolicy::Strict).stall_warning(None);
		assert_eq!(config.policy, WaitPolicy::Strict);
		assert_eq!(config.stall_warning, None);
	}
}
