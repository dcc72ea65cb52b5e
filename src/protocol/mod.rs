//! Protocol Layer.
//!
//! This module implements the client side of the pool protocol:
//! - Wire codec for pool packets (`messaging`)
//! - Session and financial parameter model (`session`)
//! - Contract of the downstream shuffle round (`round`)
//! - Bootstrap orchestration from connect to round hand-off (`bootstrap`)

pub mod bootstrap;
pub mod messaging;
pub mod round;
pub mod session;

use core::fmt;

/// Violations of session invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Operation cannot be performed in the current state.
    InvalidState,
    /// A set-once session field was written twice.
    AlreadyAssigned,
    /// The pool answered the greeting without assigning a session.
    RegistrationRejected,
    /// A stage needs session data an earlier stage did not produce.
    IncompleteSession(&'static str),
    /// The pool announced a roster of zero players.
    EmptyRoster,
    /// Two or more players presented the same verification key.
    DuplicateKeys { expected: u32, distinct: u32 },
    /// The gathered roster does not match the announced player count.
    RosterMismatch { expected: u32, received: u32 },
    /// Financial parameters are unusable.
    InvalidParameters(&'static str),
}

impl ProtocolError {
    /// True for faults caused by another participant rather than by us or the network.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::DuplicateKeys { .. } | ProtocolError::RosterMismatch { .. }
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidState => write!(f, "Invalid state for this operation"),
            ProtocolError::AlreadyAssigned => write!(f, "Session field already assigned"),
            ProtocolError::RegistrationRejected => write!(f, "Pool did not assign a session"),
            ProtocolError::IncompleteSession(what) => write!(f, "Session incomplete: missing {}", what),
            ProtocolError::EmptyRoster => write!(f, "Pool announced an empty roster"),
            ProtocolError::DuplicateKeys { expected, distinct } => write!(
                f,
                "Duplicate verification keys: {} distinct for {} players",
                distinct, expected
            ),
            ProtocolError::RosterMismatch { expected, received } => write!(
                f,
                "Roster mismatch: expected {} players, received {}",
                expected, received
            ),
            ProtocolError::InvalidParameters(what) => write!(f, "Invalid mix parameter: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}
