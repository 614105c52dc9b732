use thiserror::Error;

use crate::types::{ChallengeStatus, SessionState};

/// Violations of the challenge/session lifecycle contracts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("illegal challenge transition: {from} -> {to}")]
    IllegalChallengeTransition {
        from: ChallengeStatus,
        to: ChallengeStatus,
    },

    #[error("illegal session transition: {from} -> {to}")]
    IllegalSessionTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("unknown fight kind `{0}` (expected `timing` or `volume`)")]
    UnknownFightKind(String),
}
