//! Client-side bootstrap for a coin shuffle pool.
//!
//! Connects to the pool, registers, waits for the roster announcement,
//! exchanges verification keys and hands the finished session to a shuffle
//! round engine running on its own thread.

pub mod config;
pub mod logger;
pub mod net;
pub mod protocol;

pub use config::{FailurePolicy, MixerConfig};
pub use protocol::bootstrap::{
    BootstrapError, BootstrapOrchestrator, BootstrapReport, BootstrapState, OrchestratorHandle,
    StopHandle, Termination,
};

/// Library version as `0xMMmmpp`.
pub fn mixpool_version() -> u32 {
    0x000300
}
