//! In-process message channel.
//!
//! A `Channel` is a cloneable handle to one FIFO of byte payloads shared by
//! several threads. The orchestrator uses two of them: `to_pool` (drained by
//! the transport writer) and `from_pool` (filled by the transport reader).
//!
//! A payload of `None` is the wake sentinel: it carries no data and exists
//! only to make a blocked receiver return.
//!
//! Every handle shares one `flume::Sender`. `close()` drops it, so the
//! queue disconnects: payloads already queued are still delivered, then
//! receivers see `ChannelError::Closed`.

use core::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One queued item. `None` is the wake sentinel.
pub type Payload = Option<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Bounded channel is at capacity.
    Full,
    /// Channel was closed and fully drained.
    Closed,
    /// No payload arrived within the deadline.
    Timeout,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Full => write!(f, "Channel is full"),
            ChannelError::Closed => write!(f, "Channel is closed"),
            ChannelError::Timeout => write!(f, "Timed out waiting for a payload"),
        }
    }
}

impl std::error::Error for ChannelError {}

struct Shared {
    /// `None` once closed.
    tx: RwLock<Option<flume::Sender<Payload>>>,
    rx: flume::Receiver<Payload>,
}

/// Cloneable handle to a shared payload queue.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Creates an unbounded channel.
    pub fn new() -> Self {
        Self::from_parts(flume::unbounded())
    }

    /// Creates a channel holding at most `capacity` undelivered payloads.
    pub fn bounded(capacity: usize) -> Self {
        Self::from_parts(flume::bounded(capacity))
    }

    fn from_parts((tx, rx): (flume::Sender<Payload>, flume::Receiver<Payload>)) -> Self {
        Self {
            shared: Arc::new(Shared {
                tx: RwLock::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Enqueues a payload without blocking.
    pub fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        let tx = self.shared.tx.read().unwrap_or_else(|e| e.into_inner());
        let tx = tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.try_send(payload).map_err(|e| match e {
            flume::TrySendError::Full(_) => ChannelError::Full,
            flume::TrySendError::Disconnected(_) => ChannelError::Closed,
        })
    }

    /// Blocks until a payload is available.
    ///
    /// Payloads queued before `close()` are still delivered; afterwards this
    /// returns `ChannelError::Closed`.
    pub fn recv(&self) -> Result<Payload, ChannelError> {
        self.shared.rx.recv().map_err(|_| ChannelError::Closed)
    }

    /// Like `recv`, but gives up with `ChannelError::Timeout` after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Payload, ChannelError> {
        self.shared.rx.recv_timeout(timeout).map_err(|e| match e {
            flume::RecvTimeoutError::Timeout => ChannelError::Timeout,
            flume::RecvTimeoutError::Disconnected => ChannelError::Closed,
        })
    }

    /// Returns the next payload without blocking, if there is one.
    pub fn try_recv(&self) -> Result<Option<Payload>, ChannelError> {
        match self.shared.rx.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// Closes the channel and wakes every blocked receiver.
    pub fn close(&self) {
        let mut tx = self.shared.tx.write().unwrap_or_else(|e| e.into_inner());
        tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .tx
            .read()
            .map(|tx| tx.is_none())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.shared.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.rx.is_empty()
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let ch = Channel::new();
        ch.send(Some(vec![1])).unwrap();
        ch.send(None).unwrap();
        ch.send(Some(vec![2])).unwrap();

        assert_eq!(ch.recv().unwrap(), Some(vec![1]));
        assert_eq!(ch.recv().unwrap(), None);
        assert_eq!(ch.recv().unwrap(), Some(vec![2]));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_bounded_capacity() {
        let ch = Channel::bounded(1);
        ch.send(Some(vec![1])).unwrap();
        assert_eq!(ch.send(Some(vec![2])), Err(ChannelError::Full));
        ch.recv().unwrap();
        ch.send(Some(vec![2])).unwrap();
    }

    #[test]
    fn test_recv_timeout_expires() {
        let ch = Channel::new();
        let start = Instant::now();
        assert_eq!(
            ch.recv_timeout(Duration::from_millis(30)),
            Err(ChannelError::Timeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_sentinel_wakes_blocked_receiver() {
        let ch = Channel::new();
        let rx = ch.clone();
        let waiter = thread::spawn(move || rx.recv());

        thread::sleep(Duration::from_millis(20));
        ch.send(None).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(None));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let ch = Channel::new();
        ch.send(Some(vec![7])).unwrap();
        ch.close();

        assert!(ch.is_closed());
        assert_eq!(ch.send(Some(vec![8])), Err(ChannelError::Closed));
        assert_eq!(ch.recv().unwrap(), Some(vec![7]));
        assert_eq!(ch.recv(), Err(ChannelError::Closed));
        assert_eq!(ch.try_recv(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let ch = Channel::new();
        let rx = ch.clone();
        let waiter = thread::spawn(move || rx.recv());

        thread::sleep(Duration::from_millis(20));
        ch.close();

        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_close_is_seen_by_every_clone() {
        let ch = Channel::bounded(4);
        let other = ch.clone();
        other.close();
        other.close();

        assert!(ch.is_closed());
        assert_eq!(ch.send(None), Err(ChannelError::Closed));
        assert_eq!(ch.recv_timeout(Duration::from_millis(10)), Err(ChannelError::Closed));
    }
}
