//! Lock state machines.
//!
//! Global engine lifecycle: `Stopped ↔ Running`.
//! Per axis group: `Idle → Tracking → Locked` and back down.
//!
//! Invariant: `Locked` is only reachable from `Tracking`; leaving tracking
//! requires unlocking first.

use drift_common::types::GroupState;

/// Result of a group state transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition succeeded, new state.
    Ok(GroupState),
    /// Transition rejected, reason.
    Rejected(&'static str),
}

/// Event that can trigger a group state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    /// Start measuring positions (snapshot + controller reset).
    EngageTracking,
    /// Stop measuring.
    DisengageTracking,
    /// Start applying corrections.
    Lock,
    /// Stop applying corrections, keep tracking.
    Unlock,
    /// Stage command failed while locked.
    ActuatorFault,
    /// Engine stopped: every group returns to Idle.
    EngineStop,
}

/// Per-group lock state holder.
#[derive(Debug, Clone, Default)]
pub struct GroupStateMachine {
    state: GroupState,
}

impl GroupStateMachine {
    pub const fn new() -> Self {
        Self {
            state: GroupState::Idle,
        }
    }

    #[inline]
    pub const fn state(&self) -> GroupState {
        self.state
    }

    /// Attempt a transition given an event.
    pub fn handle_event(&mut self, event: GroupEvent) -> TransitionResult {
        use GroupEvent::*;
        use GroupState::*;

        let next = match (self.state, event) {
            (Idle, EngageTracking) => Tracking,
            (Tracking, DisengageTracking) => Idle,
            (Tracking, Lock) => Locked,
            (Locked, Unlock) => Tracking,
            (Locked, ActuatorFault) => Tracking,
            (_, EngineStop) => Idle,
            _ => return TransitionResult::Rejected(invalid_transition_reason(self.state, event)),
        };

        self.state = next;
        TransitionResult::Ok(next)
    }

    #[inline]
    pub const fn is_locked(&self) -> bool {
        matches!(self.state, GroupState::Locked)
    }
}

fn invalid_transition_reason(state: GroupState, event: GroupEvent) -> &'static str {
    use GroupEvent::*;
    use GroupState::*;
    match (state, event) {
        (Idle, Lock) => "Idle: tracking must be engaged before locking",
        (Idle, _) => "Idle: only EngageTracking allowed",
        (Tracking, EngageTracking) => "Tracking: already engaged",
        (Tracking, _) => "Tracking: not locked",
        (Locked, DisengageTracking) => "Locked: unlock before disengaging tracking",
        (Locked, _) => "Locked: already locked",
    }
}

/// Global engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Stopped,
    Running,
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use GroupEvent::*;
    use GroupState::*;

    #[test]
    fn initial_state_is_idle() {
        assert_eq!(GroupStateMachine::new().state(), Idle);
    }

    #[test]
    fn engage_lock_unlock_disengage() {
        let mut sm = GroupStateMachine::new();
        assert_eq!(sm.handle_event(EngageTracking), TransitionResult::Ok(Tracking));
        assert_eq!(sm.handle_event(Lock), TransitionResult::Ok(Locked));
        assert!(sm.is_locked());
        assert_eq!(sm.handle_event(Unlock), TransitionResult::Ok(Tracking));
        assert_eq!(sm.handle_event(DisengageTracking), TransitionResult::Ok(Idle));
    }

    #[test]
    fn lock_from_idle_rejected() {
        let mut sm = GroupStateMachine::new();
        assert!(matches!(sm.handle_event(Lock), TransitionResult::Rejected(_)));
        assert_eq!(sm.state(), Idle);
    }

    #[test]
    fn disengage_while_locked_rejected() {
        let mut sm = GroupStateMachine { state: Locked };
        assert_eq!(
            sm.handle_event(DisengageTracking),
            TransitionResult::Rejected("Locked: unlock before disengaging tracking")
        );
        assert_eq!(sm.state(), Locked);
    }

    #[test]
    fn actuator_fault_drops_to_tracking() {
        let mut sm = GroupStateMachine { state: Locked };
        assert_eq!(sm.handle_event(ActuatorFault), TransitionResult::Ok(Tracking));
        assert!(matches!(sm.handle_event(ActuatorFault), TransitionResult::Rejected(_)));
    }

    #[test]
    fn engine_stop_from_any_state() {
        for initial in [Idle, Tracking, Locked] {
            let mut sm = GroupStateMachine { state: initial };
            assert_eq!(
                sm.handle_event(EngineStop),
                TransitionResult::Ok(Idle),
                "EngineStop from {initial:?} should → Idle"
            );
        }
    }
}
