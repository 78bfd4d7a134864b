use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    /// Handshake complete; for a server, listening.
    Connected,
    Closing,
    /// Stopped for good.
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from_state: SessionState,
    pub to_state: SessionState,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Session lifecycle with transition checking and history.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    current: SessionState,
    transitions: Vec<StateTransition>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.current
    }

    pub fn transition_to(
        &mut self,
        new_state: SessionState,
        reason: &'static str,
    ) -> Result<(), InvalidTransition> {
        if !Self::is_valid_transition(self.current, new_state) {
            return Err(InvalidTransition {
                from: self.current,
                to: new_state,
            });
        }

        self.transitions.push(StateTransition {
            from_state: self.current,
            to_state: new_state,
            reason,
        });
        self.current = new_state;
        Ok(())
    }

    fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;

        match (from, to) {
            (Idle, Connecting) => true,
            // listening servers skip the handshake
            (Idle, Connected) => true,
            (Connecting, Connected) => true,
            (Connecting, Idle) => true,
            (Connecting, Closing) => true,
            (Connected, Closing) => true,
            (Closing, Idle) => true,
            (Closing, Connecting) => true,

            (_, Disconnected) if from != Disconnected => true,

            _ => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current == SessionState::Connected
    }

    pub fn is_terminal_state(&self) -> bool {
        self.current == SessionState::Disconnected
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_migrate_flow() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Idle);

        sm.transition_to(SessionState::Connecting, "start").unwrap();
        sm.transition_to(SessionState::Connected, "handshake").unwrap();
        assert!(sm.is_connected());

        sm.transition_to(SessionState::Closing, "migration").unwrap();
        sm.transition_to(SessionState::Connecting, "reconnect").unwrap();
        assert_eq!(sm.state(), SessionState::Connecting);

        let history = sm.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].reason, "migration");
        assert_eq!(history[3].from_state, SessionState::Closing);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = SessionStateMachine::new();

        let err = sm.transition_to(SessionState::Closing, "eof").unwrap_err();
        assert_eq!(err.from, SessionState::Idle);
        assert_eq!(sm.state(), SessionState::Idle);

        sm.transition_to(SessionState::Connecting, "start").unwrap();
        assert!(sm.transition_to(SessionState::Connecting, "again").is_err());
    }

    #[test]
    fn test_cannot_leave_disconnected() {
        let mut sm = SessionStateMachine::new();
        sm.transition_to(SessionState::Disconnected, "stop").unwrap();

        assert!(sm.is_terminal_state());
        assert!(sm.transition_to(SessionState::Connecting, "start").is_err());
        assert!(sm.transition_to(SessionState::Disconnected, "stop").is_err());
    }
}
