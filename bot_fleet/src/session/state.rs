//! Session lifecycle states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::FailureReason;

/// Lifecycle of one connection attempt.
///
/// Transitions only move forward: `Idle -> Connecting -> Joined -> Active`,
/// then `Disconnecting` or `Error`, then `Closed`. A new attempt is a new
/// session.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Joined,
    Active,
    Disconnecting,
    Error(FailureReason),
    Closed,
}

impl SessionState {
    /// Whether the table allows moving from `self` to `next`.
    ///
    /// Re-entering the current state is never allowed, so a repeated packet
    /// for a transition that already happened is dropped here.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Joined | Error(_) | Disconnecting)
                | (Joined, Active | Error(_) | Disconnecting)
                | (Active, Disconnecting | Error(_))
                | (Disconnecting, Closed)
                | (Error(_), Closed)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Past `Active`: the worker has been told to stop or has failed.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnecting | SessionState::Error(_) | SessionState::Closed
        )
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            SessionState::Error(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Joined => write!(f, "joined"),
            SessionState::Active => write!(f, "active"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Error(reason) => write!(f, "error ({reason})"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_reason() -> impl Strategy<Value = FailureReason> {
        prop_oneof![
            Just(FailureReason::Refused),
            Just(FailureReason::Timeout),
            Just(FailureReason::ProtocolError),
            Just(FailureReason::AuthError),
        ]
    }

    fn any_state() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Idle),
            Just(SessionState::Connecting),
            Just(SessionState::Joined),
            Just(SessionState::Active),
            Just(SessionState::Disconnecting),
            any_reason().prop_map(SessionState::Error),
            Just(SessionState::Closed),
        ]
    }

    /// Position along the lifecycle; `Disconnecting` and `Error` share a rank.
    fn rank(state: &SessionState) -> u8 {
        match state {
            SessionState::Idle => 0,
            SessionState::Connecting => 1,
            SessionState::Joined => 2,
            SessionState::Active => 3,
            SessionState::Disconnecting | SessionState::Error(_) => 4,
            SessionState::Closed => 5,
        }
    }

    #[test]
    fn happy_path() {
        let path = [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Joined,
            SessionState::Active,
            SessionState::Disconnecting,
            SessionState::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failures_close() {
        let error = SessionState::Error(FailureReason::Refused);
        assert!(SessionState::Connecting.can_transition_to(&error));
        assert!(error.can_transition_to(&SessionState::Closed));
        assert!(!error.can_transition_to(&SessionState::Disconnecting));
        assert_eq!(error.failure(), Some(FailureReason::Refused));
    }

    #[test]
    fn closed_is_final() {
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closed.can_transition_to(&SessionState::Connecting));
        assert!(!SessionState::Closed.can_transition_to(&SessionState::Idle));
    }

    #[test]
    fn idle_cannot_skip_ahead() {
        assert!(!SessionState::Idle.can_transition_to(&SessionState::Active));
        assert!(!SessionState::Connecting.can_transition_to(&SessionState::Active));
    }

    proptest! {
        #[test]
        fn never_reenters_current_state(state in any_state()) {
            prop_assert!(!state.can_transition_to(&state));
        }

        #[test]
        fn transitions_only_move_forward(from in any_state(), to in any_state()) {
            if from.can_transition_to(&to) {
                prop_assert!(rank(&to) > rank(&from));
            }
        }

        #[test]
        fn every_live_state_can_reach_closed(state in any_state()) {
            // Walk the table greedily; the exit states are always reachable.
            let mut current = state;
            for _ in 0..6 {
                if current.is_terminal() {
                    break;
                }
                current = [
                    SessionState::Connecting,
                    SessionState::Disconnecting,
                    SessionState::Error(FailureReason::ProtocolError),
                    SessionState::Closed,
                ]
                .into_iter()
                .find(|next| current.can_transition_to(next))
                .unwrap_or(current);
            }
            prop_assert!(current.is_terminal());
        }
    }
}
