//! Bootstrap Stages.
//!
//! The states a participant walks through between opening the pool
//! connection and handing the session to the round engine. Progress is
//! strictly sequential; `Terminated` can be entered from anywhere.

/// The ordered states of the bootstrap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapState {
    /// 0. Nothing opened yet.
    Disconnected,
    /// 1. Transport connected and its reader/writer running.
    Connected,
    /// 2. Pool assigned a session id and our player number.
    Registered,
    /// 3. Pool announced the roster size.
    AnnouncementReceived,
    /// 4. Our verification key was broadcast.
    KeysShared,
    /// 5. Every player's key collected and checked.
    KeysGathered,
    /// 6. Round engine running on its own thread.
    RoundRunning,
    /// 7. Done, for whatever reason.
    Terminated,
}

impl BootstrapState {
    /// Returns the next logical state.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Disconnected => Some(Self::Connected),
            Self::Connected => Some(Self::Registered),
            Self::Registered => Some(Self::AnnouncementReceived),
            Self::AnnouncementReceived => Some(Self::KeysShared),
            Self::KeysShared => Some(Self::KeysGathered),
            Self::KeysGathered => Some(Self::RoundRunning),
            Self::RoundRunning => Some(Self::Terminated),
            Self::Terminated => None,
        }
    }

    /// Whether `to` is a legal transition from this state.
    pub fn can_enter(&self, to: Self) -> bool {
        match to {
            Self::Terminated => *self != Self::Terminated,
            _ => self.next() == Some(to),
        }
    }

    /// Status line emitted when the stage leading into this state fails.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::Connected => "Error: cannot connect to server",
            Self::Registered => "Error: cannot register on the pool",
            Self::AnnouncementReceived => "Error: cannot complete the pool",
            Self::KeysShared => "Error: cannot share the keys",
            Self::KeysGathered => "Error: cannot gather the keys",
            Self::RoundRunning => "Error: cannot start the shuffle round",
            Self::Disconnected | Self::Terminated => "Error: bootstrap failed",
        }
    }
}

/// Observer for state changes.
pub trait StageObserver: Send + Sync {
    fn on_transition(&self, from: BootstrapState, to: BootstrapState);
}

impl<F> StageObserver for F
where
    F: Fn(BootstrapState, BootstrapState) + Send + Sync,
{
    fn on_transition(&self, from: BootstrapState, to: BootstrapState) {
        self(from, to)
    }
}
