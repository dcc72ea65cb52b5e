//! Bootstrap Protocol.
//!
//! Takes a participant from "nothing open" to a running shuffle round:
//! - Connect the pool transport.
//! - Register and receive a session number.
//! - Wait for the roster announcement.
//! - Share our verification key and gather everybody else's.
//! - Hand the frozen session to the round engine on its own thread.

pub mod orchestrator;
pub mod signal;
pub mod stages;

pub use orchestrator::{BootstrapOrchestrator, OrchestratorHandle, StopHandle};
pub use signal::CancelSignal;
pub use stages::{BootstrapState, StageObserver};

use super::messaging::CodecError;
use super::round::RoundOutcome;
use super::session::Session;
use super::ProtocolError;
use crate::config::ConfigError;
use crate::net::channel::ChannelError;
use crate::net::NetError;
use core::fmt;

/// Why a bootstrap stage did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// The cancellation signal was set while the stage was waiting.
    Cancelled,
    Config(ConfigError),
    Net(NetError),
    Channel(ChannelError),
    Codec(CodecError),
    Protocol(ProtocolError),
    /// A worker thread could not be started.
    Spawn,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Cancelled => write!(f, "Bootstrap cancelled"),
            BootstrapError::Config(e) => write!(f, "Configuration error: {}", e),
            BootstrapError::Net(e) => write!(f, "Network error: {}", e),
            BootstrapError::Channel(e) => write!(f, "Channel error: {}", e),
            BootstrapError::Codec(e) => write!(f, "Codec error: {}", e),
            BootstrapError::Protocol(e) => write!(f, "Protocol error: {}", e),
            BootstrapError::Spawn => write!(f, "Failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<ConfigError> for BootstrapError {
    fn from(e: ConfigError) -> Self {
        BootstrapError::Config(e)
    }
}

impl From<NetError> for BootstrapError {
    fn from(e: NetError) -> Self {
        BootstrapError::Net(e)
    }
}

impl From<ChannelError> for BootstrapError {
    fn from(e: ChannelError) -> Self {
        BootstrapError::Channel(e)
    }
}

impl From<CodecError> for BootstrapError {
    fn from(e: CodecError) -> Self {
        BootstrapError::Codec(e)
    }
}

impl From<ProtocolError> for BootstrapError {
    fn from(e: ProtocolError) -> Self {
        BootstrapError::Protocol(e)
    }
}

/// How a bootstrap run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The round engine ran and returned.
    RoundFinished(RoundOutcome),
    /// Stopped by request before the round started.
    Stopped { at: BootstrapState },
    /// A stage failed; `at` is the last state reached.
    Aborted { at: BootstrapState, error: BootstrapError },
    /// Another participant broke the protocol during key gathering.
    ProtocolViolation { at: BootstrapState, error: ProtocolError },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::RoundFinished(RoundOutcome::Completed) => write!(f, "round completed"),
            Termination::RoundFinished(RoundOutcome::Failed { reason }) => {
                write!(f, "round failed: {}", reason)
            }
            Termination::RoundFinished(RoundOutcome::Interrupted) => write!(f, "round interrupted"),
            Termination::Stopped { at } => write!(f, "stopped at {:?}", at),
            Termination::Aborted { at, error } => write!(f, "aborted at {:?}: {}", at, error),
            Termination::ProtocolViolation { at, error } => {
                write!(f, "protocol violation at {:?}: {}", at, error)
            }
        }
    }
}

/// Final snapshot of a finished bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub session: Session,
    pub state: BootstrapState,
    pub termination: Option<Termination>,
}
