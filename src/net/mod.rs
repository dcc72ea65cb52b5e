//! Network Layer.
//!
//! Everything between the orchestrator and the pool server's socket:
//! - `channel`: in-process FIFO handles carrying byte payloads between threads.
//! - `framing`: length-prefixed frames on a byte stream.
//! - `transport`: the contract the orchestrator drives (connect/start/join).
//! - `tcp`: the TCP implementation of that contract.
//! - `noise_xx`: optional transport-level encryption for `tcp`.

pub mod channel;
pub mod framing;
pub mod noise_xx;
pub mod tcp;
pub mod transport;

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    ConnectionFailed,
    Timeout,
    EncryptionError,
    DecryptionError,
    InvalidMessage,
    FrameTooLarge,
    IOError,
    HandshakeFailed,
    StreamClosed,
    InvalidAddress,
    NotConnected,
    AlreadyStarted,
    NonceExhausted,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::ConnectionFailed => write!(f, "Connection failed"),
            NetError::Timeout => write!(f, "Operation timed out"),
            NetError::EncryptionError => write!(f, "Encryption failed"),
            NetError::DecryptionError => write!(f, "Decryption failed"),
            NetError::InvalidMessage => write!(f, "Invalid message format"),
            NetError::FrameTooLarge => write!(f, "Frame exceeds the configured maximum length"),
            NetError::IOError => write!(f, "I/O error"),
            NetError::HandshakeFailed => write!(f, "Handshake failed"),
            NetError::StreamClosed => write!(f, "Stream closed"),
            NetError::InvalidAddress => write!(f, "Invalid address format"),
            NetError::NotConnected => write!(f, "Transport is not connected"),
            NetError::AlreadyStarted => write!(f, "Transport delivery loop already started"),
            NetError::NonceExhausted => write!(f, "Cipher nonce space exhausted"),
        }
    }
}

impl std::error::Error for NetError {}
