//! Shuffle round contract.
//!
//! The cryptographic shuffle itself lives outside this crate. The
//! orchestrator only needs to build an engine from a finished session, run
//! it on its own thread, ask it to stop early, and learn how it ended.

use super::messaging::{Messages, Phase};
use super::session::{Network, SecretKey, Session, VerificationKey};
use crate::logger::Logger;
use crate::net::channel::Channel;
use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything a round engine is constructed with.
pub struct RoundParams {
    pub network: Network,
    /// Empty packet collection for the round's own traffic.
    pub codec: Messages,
    pub to_pool: Channel,
    pub from_pool: Channel,
    pub logger: Arc<dyn Logger>,
    /// Frozen session: id, our number and the full roster.
    pub session: Arc<Session>,
    pub begin_phase: Phase,
    pub amount: u64,
    pub fee: u64,
    pub secret_key: SecretKey,
    pub verification_key: VerificationKey,
    pub dest_addr: String,
    pub change_addr: String,
    /// Set by the orchestrator to request early termination.
    pub done: Arc<AtomicBool>,
}

impl RoundParams {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RoundParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundParams")
            .field("network", &self.network)
            .field("session", &self.session)
            .field("begin_phase", &self.begin_phase)
            .field("amount", &self.amount)
            .field("fee", &self.fee)
            .field("verification_key", &self.verification_key)
            .field("dest_addr", &self.dest_addr)
            .field("change_addr", &self.change_addr)
            .finish_non_exhaustive()
    }
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The shuffle finished and the transaction was handled.
    Completed,
    /// The round gave up, e.g. after blame.
    Failed { reason: String },
    /// The round saw its `done` flag and returned early.
    Interrupted,
}

/// A runnable shuffle round.
pub trait RoundEngine: Send {
    /// Runs the round to completion on the calling thread.
    fn run_loop(&mut self) -> RoundOutcome;
}

/// Builds round engines. Owns whatever crypto provider the engine needs.
pub trait RoundFactory: Send {
    fn build(&mut self, params: RoundParams) -> Box<dyn RoundEngine>;
}

impl<F> RoundFactory for F
where
    F: FnMut(RoundParams) -> Box<dyn RoundEngine> + Send,
{
    fn build(&mut self, params: RoundParams) -> Box<dyn RoundEngine> {
        self(params)
    }
}
