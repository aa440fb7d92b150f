//! Observable supervisor lifecycle state.
//!
//! Written only by the supervisor loop; anything else holds a read handle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where the supervisor is in its lifecycle. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Connected = 0,
    Switching = 1,
    Terminated = 2,
}

impl SupervisorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SupervisorState::Connected,
            1 => SupervisorState::Switching,
            _ => SupervisorState::Terminated,
        }
    }
}

/// Shared view of the supervisor state. Cheap to clone (Arc).
#[derive(Debug, Clone)]
pub struct StateHandle {
    inner: Arc<AtomicU8>,
}

impl StateHandle {
    pub(crate) fn new(state: SupervisorState) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(state as u8)),
        }
    }

    pub fn get(&self) -> SupervisorState {
        SupervisorState::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SupervisorState) {
        let previous = SupervisorState::from_u8(self.inner.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Supervisor state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_observe_writes() {
        let handle = StateHandle::new(SupervisorState::Connected);
        let observer = handle.clone();

        handle.set(SupervisorState::Switching);
        assert_eq!(observer.get(), SupervisorState::Switching);

        handle.set(SupervisorState::Terminated);
        assert_eq!(observer.get(), SupervisorState::Terminated);
    }

    #[test]
    fn test_unknown_discriminant_reads_as_terminated() {
        assert_eq!(SupervisorState::from_u8(7), SupervisorState::Terminated);
    }
}
