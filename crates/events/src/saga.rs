//! Wallet transfer saga: states, inbound events, and the pure transition
//! table.
//!
//! The table is data, not behavior: `transition` answers "what comes next",
//! the coordinator in infra owns persistence, idempotency and compensation.
//! `COMPLETED` and `FAILED` are terminal; every (state, event) pair not in
//! the table is an invalid transition the coordinator rejects without
//! blocking forward progress.

use serde::{Deserialize, Serialize};

use crate::event::event_types;

/// Saga instance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Initial,
    WalletCreated,
    FundsAdded,
    FundsWithdrawn,
    FundsTransferred,
    Completed,
    Failed,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Initial => "INITIAL",
            SagaState::WalletCreated => "WALLET_CREATED",
            SagaState::FundsAdded => "FUNDS_ADDED",
            SagaState::FundsWithdrawn => "FUNDS_WITHDRAWN",
            SagaState::FundsTransferred => "FUNDS_TRANSFERRED",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
        }
    }
}

impl core::str::FromStr for SagaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIAL" => Ok(SagaState::Initial),
            "WALLET_CREATED" => Ok(SagaState::WalletCreated),
            "FUNDS_ADDED" => Ok(SagaState::FundsAdded),
            "FUNDS_WITHDRAWN" => Ok(SagaState::FundsWithdrawn),
            "FUNDS_TRANSFERRED" => Ok(SagaState::FundsTransferred),
            "COMPLETED" => Ok(SagaState::Completed),
            "FAILED" => Ok(SagaState::Failed),
            other => Err(format!("unknown saga state '{other}'")),
        }
    }
}

impl core::fmt::Display for SagaState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive saga transitions.
///
/// The first four arrive from the bus; `SagaCompleted` is submitted by the
/// coordinator itself after the transfer step, `SagaFailed` comes from the
/// coordinator (escalation), the reaper (timeout) or inbound dispatch
/// (missing correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaEventKind {
    WalletCreated,
    FundsAdded,
    FundsWithdrawn,
    FundsTransferred,
    SagaCompleted,
    SagaFailed,
}

impl SagaEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaEventKind::WalletCreated => "WALLET_CREATED",
            SagaEventKind::FundsAdded => "FUNDS_ADDED",
            SagaEventKind::FundsWithdrawn => "FUNDS_WITHDRAWN",
            SagaEventKind::FundsTransferred => "FUNDS_TRANSFERRED",
            SagaEventKind::SagaCompleted => "SAGA_COMPLETED",
            SagaEventKind::SagaFailed => "SAGA_FAILED",
        }
    }
}

impl core::fmt::Display for SagaEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the pair is invalid.
pub fn transition(state: SagaState, event: SagaEventKind) -> Option<SagaState> {
    use SagaEventKind as E;
    use SagaState as S;

    match (state, event) {
        (S::Initial, E::WalletCreated) => Some(S::WalletCreated),
        (S::WalletCreated, E::FundsAdded) => Some(S::FundsAdded),
        (S::FundsAdded, E::FundsWithdrawn) => Some(S::FundsWithdrawn),
        (S::FundsWithdrawn, E::FundsTransferred) => Some(S::FundsTransferred),
        (S::FundsTransferred, E::SagaCompleted) => Some(S::Completed),
        (s, E::SagaFailed) if !s.is_terminal() => Some(S::Failed),
        _ => None,
    }
}

/// Saga event for an inbound envelope type. Only the four forward wallet
/// events map; everything else (reversals, unknown types) is not routed to
/// the saga.
pub fn saga_event_for_type(event_type: &str) -> Option<SagaEventKind> {
    match event_type {
        event_types::WALLET_CREATED => Some(SagaEventKind::WalletCreated),
        event_types::FUNDS_ADDED => Some(SagaEventKind::FundsAdded),
        event_types::FUNDS_WITHDRAWN => Some(SagaEventKind::FundsWithdrawn),
        event_types::FUNDS_TRANSFERRED => Some(SagaEventKind::FundsTransferred),
        _ => None,
    }
}

/// Reversal event types to emit when a saga fails in `from`, in emission
/// order (reverse of the forward history implied by the state).
pub fn compensation_path(from: SagaState) -> &'static [&'static str] {
    match from {
        SagaState::WalletCreated => &[event_types::REVERSAL_CREATED],
        SagaState::FundsAdded => &[
            event_types::REVERSAL_FUNDS_ADDED,
            event_types::REVERSAL_CREATED,
        ],
        SagaState::FundsWithdrawn => &[
            event_types::REVERSAL_FUNDS_WITHDRAWN,
            event_types::REVERSAL_FUNDS_ADDED,
            event_types::REVERSAL_CREATED,
        ],
        SagaState::FundsTransferred => &[
            event_types::REVERSAL_FUNDS_TRANSFERRED,
            event_types::REVERSAL_FUNDS_WITHDRAWN,
            event_types::REVERSAL_FUNDS_ADDED,
            event_types::REVERSAL_CREATED,
        ],
        SagaState::Initial | SagaState::Completed | SagaState::Failed => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SagaState; 7] = [
        SagaState::Initial,
        SagaState::WalletCreated,
        SagaState::FundsAdded,
        SagaState::FundsWithdrawn,
        SagaState::FundsTransferred,
        SagaState::Completed,
        SagaState::Failed,
    ];

    const ALL_EVENTS: [SagaEventKind; 6] = [
        SagaEventKind::WalletCreated,
        SagaEventKind::FundsAdded,
        SagaEventKind::FundsWithdrawn,
        SagaEventKind::FundsTransferred,
        SagaEventKind::SagaCompleted,
        SagaEventKind::SagaFailed,
    ];

    #[test]
    fn happy_path_is_a_valid_chain() {
        let mut state = SagaState::Initial;
        for event in [
            SagaEventKind::WalletCreated,
            SagaEventKind::FundsAdded,
            SagaEventKind::FundsWithdrawn,
            SagaEventKind::FundsTransferred,
            SagaEventKind::SagaCompleted,
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, SagaState::Completed);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [SagaState::Completed, SagaState::Failed] {
            for event in ALL_EVENTS {
                assert_eq!(transition(state, event), None, "{state} + {event}");
            }
        }
    }

    #[test]
    fn every_non_terminal_state_fails_on_saga_failed() {
        for state in ALL_STATES.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(
                transition(*state, SagaEventKind::SagaFailed),
                Some(SagaState::Failed)
            );
        }
    }

    #[test]
    fn off_path_pairs_are_invalid() {
        assert_eq!(
            transition(SagaState::Initial, SagaEventKind::FundsAdded),
            None
        );
        assert_eq!(
            transition(SagaState::FundsTransferred, SagaEventKind::FundsAdded),
            None
        );
        assert_eq!(
            transition(SagaState::WalletCreated, SagaEventKind::SagaCompleted),
            None
        );
    }

    #[test]
    fn declared_transitions_only_enter_declared_successors() {
        // Every reachable (from, to) pair must be one of the six declared
        // rows of the table.
        let declared: &[(SagaState, SagaEventKind, SagaState)] = &[
            (
                SagaState::Initial,
                SagaEventKind::WalletCreated,
                SagaState::WalletCreated,
            ),
            (
                SagaState::WalletCreated,
                SagaEventKind::FundsAdded,
                SagaState::FundsAdded,
            ),
            (
                SagaState::FundsAdded,
                SagaEventKind::FundsWithdrawn,
                SagaState::FundsWithdrawn,
            ),
            (
                SagaState::FundsWithdrawn,
                SagaEventKind::FundsTransferred,
                SagaState::FundsTransferred,
            ),
            (
                SagaState::FundsTransferred,
                SagaEventKind::SagaCompleted,
                SagaState::Completed,
            ),
        ];

        for state in ALL_STATES {
            for event in ALL_EVENTS {
                match transition(state, event) {
                    None => {}
                    Some(SagaState::Failed) => {
                        assert_eq!(event, SagaEventKind::SagaFailed);
                        assert!(!state.is_terminal());
                    }
                    Some(next) => {
                        assert!(
                            declared.contains(&(state, event, next)),
                            "undeclared transition {state} + {event} -> {next}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn compensation_reverses_the_forward_history() {
        assert_eq!(
            compensation_path(SagaState::FundsAdded),
            &[
                event_types::REVERSAL_FUNDS_ADDED,
                event_types::REVERSAL_CREATED
            ]
        );
        assert!(compensation_path(SagaState::Initial).is_empty());
        assert!(compensation_path(SagaState::Failed).is_empty());
    }

    #[test]
    fn state_round_trips_through_storage_form() {
        for state in ALL_STATES {
            assert_eq!(state.as_str().parse::<SagaState>().unwrap(), state);
        }
    }
}
