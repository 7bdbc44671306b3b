//! Central system state machine
//!
//! ```text
//!  STARTING ──► IDLE ──► PRINTING ──► RUNOUT
//!                 ▲          │           │
//!                 │          ▼           ▼
//!                 │      PAUSED ◄────────┘
//!                 │          │
//!                 │          ▼
//!                 └── FEEDING ──► RESUMING ──► PRINTING
//! ```
//!
//! Transitions are total and side-effect-free: an accepted transition only
//! mutates the state and records the event payload, returning a
//! [`Transition`] record. The coordinator's post-transition handler reads
//! `(old, new, payload)` and performs the I/O. Unlisted transitions are
//! rejected and keep the current state.

use tracing::{debug, info};

/// System run states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemState {
    /// Initializing, links not yet up
    #[default]
    Starting,
    Idle,
    Printing,
    /// Paused for any reason (runout or user-initiated)
    Paused,
    /// Active extruder ran out of filament mid-print
    Runout,
    /// Cabinet is feeding new filament
    Feeding,
    /// Filament restored, resume issued, waiting for the printer
    Resuming,
    Error,
    /// Shut down, no further transitions
    Disconnected,
}

impl SystemState {
    /// Check if a transition to `target` is admissible
    pub fn can_transition_to(&self, target: SystemState) -> bool {
        use SystemState::*;
        match (*self, target) {
            // shutdown is terminal
            (Disconnected, _) => false,
            // normal print lifecycle
            (Idle, Printing)
            | (Printing, Runout)
            | (Paused, Feeding)
            | (Feeding, Resuming)
            | (Resuming, Printing) => true,
            // pause can interrupt most active states
            (Idle | Printing | Runout | Resuming, Paused) => true,
            // error and shutdown are reachable from anywhere
            (from, Error) => from != Error,
            (from, Disconnected) => from != Disconnected,
            // init complete, print complete/cancelled, error recovery
            (from, Idle) => from != Idle,
            _ => false,
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SystemState::Starting => "STARTING",
            SystemState::Idle => "IDLE",
            SystemState::Printing => "PRINTING",
            SystemState::Paused => "PAUSED",
            SystemState::Runout => "RUNOUT",
            SystemState::Feeding => "FEEDING",
            SystemState::Resuming => "RESUMING",
            SystemState::Error => "ERROR",
            SystemState::Disconnected => "DISCONNECTED",
        };
        write!(f, "{name}")
    }
}

/// Payload attached by the transition that produced the current state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePayload {
    /// Extruder concerned by a runout / feed cycle
    pub extruder: Option<u8>,
    /// Error cause
    pub reason: Option<String>,
}

impl StatePayload {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn extruder(extruder: u8) -> Self {
        Self {
            extruder: Some(extruder),
            ..Self::default()
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Record of one accepted transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub old: SystemState,
    pub new: SystemState,
    pub payload: StatePayload,
}

/// The machine itself. Written only by the coordinator's event task, so no
/// internal synchronization is needed.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SystemState,
    payload: StatePayload,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn payload(&self) -> &StatePayload {
        &self.payload
    }

    pub fn is_state(&self, state: SystemState) -> bool {
        self.state == state
    }

    /// Attempt a transition. Returns the transition record when accepted;
    /// a same-state or inadmissible request leaves the machine untouched.
    pub fn transition_to(
        &mut self,
        new_state: SystemState,
        payload: StatePayload,
    ) -> Option<Transition> {
        if self.state == new_state {
            return None;
        }
        if !self.state.can_transition_to(new_state) {
            debug!(from = %self.state, to = %new_state, "transition rejected");
            return None;
        }

        let old = self.state;
        self.state = new_state;
        self.payload = payload.clone();
        info!(from = %old, to = %new_state, "system state transition");
        Some(Transition {
            old,
            new: new_state,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SystemState::*;

    #[test]
    fn startup_to_idle() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.state(), Starting);
        let transition = machine.transition_to(Idle, StatePayload::none()).unwrap();
        assert_eq!(transition.old, Starting);
        assert_eq!(transition.new, Idle);
    }

    #[test]
    fn runout_cycle() {
        let mut machine = StateMachine::new();
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        machine.transition_to(Printing, StatePayload::none()).unwrap();

        let transition = machine
            .transition_to(Runout, StatePayload::extruder(0))
            .unwrap();
        assert_eq!(transition.payload.extruder, Some(0));

        machine.transition_to(Paused, StatePayload::extruder(0)).unwrap();
        machine.transition_to(Feeding, StatePayload::extruder(0)).unwrap();
        machine.transition_to(Resuming, StatePayload::extruder(0)).unwrap();
        machine.transition_to(Printing, StatePayload::none()).unwrap();
        assert_eq!(machine.state(), Printing);
    }

    #[test]
    fn same_state_is_a_noop() {
        let mut machine = StateMachine::new();
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        assert!(machine.transition_to(Idle, StatePayload::none()).is_none());
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn inadmissible_transitions_keep_state() {
        let mut machine = StateMachine::new();
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        // cannot run out while idle
        assert!(machine
            .transition_to(Runout, StatePayload::extruder(0))
            .is_none());
        assert_eq!(machine.state(), Idle);
        // cannot feed without a pause
        machine.transition_to(Printing, StatePayload::none()).unwrap();
        assert!(machine
            .transition_to(Feeding, StatePayload::extruder(0))
            .is_none());
        assert_eq!(machine.state(), Printing);
    }

    #[test]
    fn pause_reachable_from_active_states() {
        for from in [Idle, Printing, Runout, Resuming] {
            assert!(from.can_transition_to(Paused), "{from} → PAUSED");
        }
        assert!(!Starting.can_transition_to(Paused));
        assert!(!Error.can_transition_to(Paused));
    }

    #[test]
    fn print_end_returns_to_idle() {
        for from in [Printing, Paused, Runout, Feeding, Resuming, Error] {
            assert!(from.can_transition_to(Idle), "{from} → IDLE");
        }
    }

    #[test]
    fn error_from_anywhere_and_recovery() {
        let mut machine = StateMachine::new();
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        machine.transition_to(Printing, StatePayload::none()).unwrap();
        let transition = machine
            .transition_to(Error, StatePayload::reason("pause rejected"))
            .unwrap();
        assert_eq!(transition.payload.reason.as_deref(), Some("pause rejected"));
        // printer reports ready again
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn shutdown_from_any_state() {
        for from in [Starting, Idle, Printing, Paused, Runout, Feeding, Resuming, Error] {
            assert!(from.can_transition_to(Disconnected), "{from} → DISCONNECTED");
        }
    }

    #[test]
    fn disconnected_is_terminal() {
        for target in [Starting, Idle, Printing, Paused, Runout, Feeding, Resuming, Error] {
            assert!(!Disconnected.can_transition_to(target), "DISCONNECTED → {target}");
        }
        let mut machine = StateMachine::new();
        machine.transition_to(Disconnected, StatePayload::none()).unwrap();
        assert!(machine.transition_to(Idle, StatePayload::none()).is_none());
        assert!(machine
            .transition_to(Error, StatePayload::reason("late failure"))
            .is_none());
        assert_eq!(machine.state(), Disconnected);
    }

    #[test]
    fn payload_survives_until_next_transition() {
        let mut machine = StateMachine::new();
        machine.transition_to(Idle, StatePayload::none()).unwrap();
        machine.transition_to(Printing, StatePayload::none()).unwrap();
        machine
            .transition_to(Runout, StatePayload::extruder(1))
            .unwrap();
        machine
            .transition_to(Paused, StatePayload::extruder(1))
            .unwrap();
        assert_eq!(machine.payload().extruder, Some(1));
    }
}
