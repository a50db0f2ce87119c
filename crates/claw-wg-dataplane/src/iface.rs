//! Link state of the WireGuard interface.
//!
//! Peer and route programming is gated on the link being `Up`. Entering
//! `Up`, or seeing the index change while up (the link was recreated),
//! asks the reconcilers for a full resync.

use tracing::{debug, info};

use crate::types::OperStatus;

/// Last known state of the interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceState {
    /// Interface name.
    pub name: String,
    /// Kernel interface index, 0 until known.
    pub index: u32,
    /// Operational status.
    pub oper_status: OperStatus,
}

/// Effect of a link notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Notification was for another interface.
    Ignored,
    /// Nothing relevant changed.
    Unchanged,
    /// The link came up.
    BecameUp,
    /// The link is still up but under a new index.
    IndexChanged,
    /// The link left `Up`.
    LeftUp,
}

impl Transition {
    /// Whether peers and routes must be reprogrammed from scratch.
    #[must_use]
    pub const fn needs_resync(self) -> bool {
        matches!(self, Self::BecameUp | Self::IndexChanged)
    }
}

/// Tracks `Unknown -> Down -> Up` for one named interface.
#[derive(Debug, Clone)]
pub struct InterfaceStateMachine {
    state: InterfaceState,
}

impl InterfaceStateMachine {
    /// Creates a tracker for `name` in the `Unknown` state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: InterfaceState { name: name.into(), index: 0, oper_status: OperStatus::Unknown },
        }
    }

    /// Handles a link-state notification.
    pub fn on_state_changed(&mut self, name: &str, index: u32, status: OperStatus) -> Transition {
        if name != self.state.name {
            debug!(interface = name, "ignoring link update for other interface");
            return Transition::Ignored;
        }

        let was_up = self.is_up();
        let old_index = self.state.index;
        self.state.index = index;
        self.state.oper_status = status;

        let transition = match (was_up, status == OperStatus::Up) {
            (false, true) => Transition::BecameUp,
            (true, false) => Transition::LeftUp,
            (true, true) if old_index != index => Transition::IndexChanged,
            _ => Transition::Unchanged,
        };
        if transition != Transition::Unchanged {
            info!(interface = name, index, status = %status, ?transition, "interface state changed");
        }
        transition
    }

    /// Forgets the link, e.g. after the device was deleted.
    pub fn reset(&mut self) {
        self.state.index = 0;
        self.state.oper_status = OperStatus::Unknown;
    }

    /// Whether the link is up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.state.oper_status == OperStatus::Up
    }

    /// Interface index, 0 until known.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.state.index
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &InterfaceState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown() {
        let sm = InterfaceStateMachine::new("wg0");
        assert_eq!(sm.state().oper_status, OperStatus::Unknown);
        assert!(!sm.is_up());
    }

    #[test]
    fn unknown_down_up() {
        let mut sm = InterfaceStateMachine::new("wg0");
        assert_eq!(sm.on_state_changed("wg0", 3, OperStatus::Down), Transition::Unchanged);
        assert!(!sm.is_up());
        let t = sm.on_state_changed("wg0", 3, OperStatus::Up);
        assert_eq!(t, Transition::BecameUp);
        assert!(t.needs_resync());
        assert_eq!(sm.index(), 3);
        assert_eq!(sm.on_state_changed("wg0", 3, OperStatus::Up), Transition::Unchanged);
    }

    #[test]
    fn recreate_while_up_changes_index() {
        let mut sm = InterfaceStateMachine::new("wg0");
        sm.on_state_changed("wg0", 3, OperStatus::Up);
        let t = sm.on_state_changed("wg0", 9, OperStatus::Up);
        assert_eq!(t, Transition::IndexChanged);
        assert!(t.needs_resync());
    }

    #[test]
    fn leaving_up_does_not_resync() {
        let mut sm = InterfaceStateMachine::new("wg0");
        sm.on_state_changed("wg0", 3, OperStatus::Up);
        let t = sm.on_state_changed("wg0", 3, OperStatus::Down);
        assert_eq!(t, Transition::LeftUp);
        assert!(!t.needs_resync());
        assert!(!sm.is_up());
    }

    #[test]
    fn other_interfaces_ignored() {
        let mut sm = InterfaceStateMachine::new("wg0");
        assert_eq!(sm.on_state_changed("eth0", 2, OperStatus::Up), Transition::Ignored);
        assert!(!sm.is_up());
        assert_eq!(sm.index(), 0);
    }

    #[test]
    fn reset_forgets_link() {
        let mut sm = InterfaceStateMachine::new("wg0");
        sm.on_state_changed("wg0", 3, OperStatus::Up);
        sm.reset();
        assert!(!sm.is_up());
        assert_eq!(sm.on_state_changed("wg0", 4, OperStatus::Up), Transition::BecameUp);
    }
}
