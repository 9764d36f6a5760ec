#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

/// Holder of at most one outstanding [`EventSubGuard`].
#[derive(Debug)]
pub struct GuardSlot(AtomicBool);

impl GuardSlot {
	pub const fn new() -> Self {
		Self(AtomicBool::new(false))
	}

	pub fn is_owned(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

impl Default for GuardSlot {
	fn default() -> Self {
		Self::new()
	}
}

static PROCESS_SLOT: GuardSlot = GuardSlot::new();

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventSubGuardError {
	#[error("an EventSub session is already owned by this process")]
	AlreadyOwned,
}

/// Ownership token for the EventSub session. At most one exists per slot;
/// dropping it releases the slot.
#[derive(Debug)]
pub struct EventSubGuard {
	slot: &'static GuardSlot,
}

impl EventSubGuard {
	/// Acquire the process-wide token.
	pub fn acquire() -> Result<Self, EventSubGuardError> {
		Self::acquire_in(&PROCESS_SLOT)
	}

	pub fn acquire_in(slot: &'static GuardSlot) -> Result<Self, EventSubGuardError> {
		slot.0
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.map(|_| Self { slot })
			.map_err(|_| EventSubGuardError::AlreadyOwned)
	}
}

impl Drop for EventSubGuard {
	fn drop(&mut self) {
		self.slot.0.store(false, Ordering::SeqCst);
	}
}
