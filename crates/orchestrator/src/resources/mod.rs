//! RAII resource guards for automatic cleanup.
//!
//! - [`SlotGuard`] - releases the single active-build slot, even when the
//!   build worker panics

mod slot_guard;

pub use slot_guard::{ActiveBuild, SessionSlot, SlotGuard};
