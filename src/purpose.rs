//! Purpose tags and compatibility sets.
//!
//! Every acquisition may carry a [`Purpose`]. Purposes never order requests,
//! they only decide whether two requests may overlap: a request passes a
//! [`Compatibility`] set when the set lists its purpose, or, for share
//! requests, when the set admits fresh shares outright.

use smallvec::SmallVec;
use std::fmt;

/// An opaque tag attached to an acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Purpose(&'static str);

impl Purpose {
	/// Creates a purpose with the given name.
	pub const fn new(name: &'static str) -> Purpose {
		Purpose(name)
	}

	/// The name the purpose was created with.
	pub const fn name(&self) -> &'static str {
		self.0
	}
}

impl fmt::Display for Purpose {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.0)
	}
}

/// Purpose of code being loaded.
pub const LOAD: Purpose = Purpose::new("load");

/// Purpose of code being unloaded.
pub const UNLOAD: Purpose = Purpose::new("unload");

/// A request as seen by a compatibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Request {
	Share(Option<Purpose>),
	Exclusive(Option<Purpose>),
}

/// The set of requests allowed to proceed alongside a holder or waiter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Compatibility {
	purposes: SmallVec<[Purpose; 4]>,
	shares: bool,
}

impl Compatibility {
	/// A set that allows nothing.
	pub fn none() -> Compatibility {
		Compatibility::default()
	}

	/// A set allowing the given purposes.
	pub fn of(purposes: &[Purpose]) -> Compatibility {
		let mut compatible = Compatibility::none();
		for purpose in purposes {
			compatible.insert(*purpose);
		}
		compatible
	}

	/// Also admit fresh share acquisitions, whatever their purpose.
	pub fn with_shares(mut self) -> Compatibility {
		self.shares = true;
		self
	}

	/// Whether fresh share acquisitions are admitted.
	pub fn admits_shares(&self) -> bool {
		self.shares
	}

	/// Whether `purpose` is listed.
	pub fn contains(&self, purpose: Purpose) -> bool {
		self.purposes.contains(&purpose)
	}

	/// The listed purposes, in insertion order.
	pub fn purposes(&self) -> &[Purpose] {
		&self.purposes
	}

	fn insert(&mut self, purpose: Purpose) {
		if !self.contains(purpose) {
			self.purposes.push(purpose);
		}
	}

	pub(crate) fn allows(&self, request: Request) -> bool {
		match request {
			Request::Share(purpose) => self.shares || purpose.is_some_and(|p| self.contains(p)),
			Request::Exclusive(purpose) => purpose.is_some_and(|p| self.contains(p)),
		}
	}

	/// Keeps only what both sets allow.
	pub(crate) fn intersect(&self, other: &Compatibility) -> Compatibility {
		Compatibility {
			purposes: self.purposes.iter().copied().filter(|p| other.contains(*p)).collect(),
			shares: self.shares && other.shares,
		}
	}

	/// Allows what either set allows.
	pub(crate) fn union(&self, other: &Compatibility) -> Compatibility {
		let mut merged = self.clone();
		for purpose in &other.purposes {
			merged.insert(*purpose);
		}
		merged.shares |= other.shares;
		merged
	}
}

impl fmt::Display for Compatibility {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[")?;
		let mut first = true;
		for purpose in &self.purposes {
			if !first {
				f.write_str(", ")?;
			}
			first = false;
			write!(f, "{purpose}")?;
		}
		if self.shares {
			if !first {
				f.write_str(", ")?;
			}
			f.write_str("<shares>")?;
		}
		f.write_str("]")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn share_requests_need_a_listed_purpose_or_admitted_shares() {
		let loads = Compatibility::of(&[LOAD]);
		assert!(loads.allows(Request::Share(Some(LOAD))));
		assert!(!loads.allows(Request::Share(Some(UNLOAD))));
		assert!(!loads.allows(Request::Share(None)));

		let open = loads.with_shares();
		assert!(open.allows(Request::Share(None)));
		assert!(open.allows(Request::Share(Some(UNLOAD))));
	}

	#[test]
	fn exclusive_requests_ignore_admitted_shares() {
		let open = Compatibility::of(&[LOAD]).with_shares();
		assert!(open.allows(Request::Exclusive(Some(LOAD))));
		assert!(!open.allows(Request::Exclusive(Some(UNLOAD))));
		assert!(!open.allows(Request::Exclusive(None)));
	}

	#[test]
	fn intersect_and_union() {
		let a = Compatibility::of(&[LOAD, UNLOAD]).with_shares();
		let b = Compatibility::of(&[LOAD]);

		let both = a.intersect(&b);
		assert_eq!(both.purposes(), &[LOAD]);
		assert!(!both.admits_shares());

		let either = b.union(&a);
		assert_eq!(either.purposes(), &[LOAD, UNLOAD]);
		assert!(either.admits_shares());
	}

	#[test]
	fn display_lists_purposes() {
		assert_eq!(Compatibility::none().to_string(), "[]");
		assert_eq!(Compatibility::of(&[LOAD]).with_shares().to_string(), "[load, <shares>]");
	}
}
