//! Status sink for human-readable progress lines.
//!
//! The orchestrator reports what a user would want to see ("Player 2 joined
//! the pool!") through a `Logger`. This is separate from the `log` facade,
//! which carries developer diagnostics.

use crate::net::channel::Channel;
use std::sync::Mutex;

/// Fire-and-forget receiver of status lines.
pub trait Logger: Send + Sync {
    fn send(&self, line: &str);
}

impl<F> Logger for F
where
    F: Fn(&str) + Send + Sync,
{
    fn send(&self, line: &str) {
        self(line)
    }
}

/// Prints every line to stdout and mirrors it to `log`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn send(&self, line: &str) {
        let line = line.trim_end();
        println!("{}", line);
        log::info!("{}", line);
    }
}

/// Pushes every line onto a `Channel` for another thread (usually a UI) to drain.
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    channel: Channel,
    echo: bool,
}

impl ChannelLogger {
    pub fn new(channel: Channel) -> Self {
        Self { channel, echo: false }
    }

    /// Also prints each line to stdout.
    pub fn with_echo(channel: Channel) -> Self {
        Self { channel, echo: true }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Logger for ChannelLogger {
    fn send(&self, line: &str) {
        if self.echo {
            println!("{}", line.trim_end());
        }
        if let Err(e) = self.channel.send(Some(line.as_bytes().to_vec())) {
            log::debug!("Status line dropped: {}", e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub line: String,
}

/// Keeps a timestamped transcript in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.line).collect()
    }

    /// True if any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.iter().any(|entry| entry.line.contains(needle)))
            .unwrap_or(false)
    }
}

impl Logger for MemoryLogger {
    fn send(&self, line: &str) {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                timestamp,
                line: line.trim_end().to_string(),
            });
        }
    }
}
