//! Length-prefixed framing.
//!
//! Every message on the pool socket is `u32 BE length || bytes`. Handshake
//! messages and (encrypted or plain) session messages use the same framing.

use crate::net::NetError;
use std::io::{self, Read, Write};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

fn map_io(err: io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => NetError::StreamClosed,
        _ => NetError::IOError,
    }
}

/// Writes one frame and flushes the writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<(), NetError> {
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(NetError::FrameTooLarge);
    }
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).map_err(map_io)?;
    writer.write_all(payload).map_err(map_io)?;
    writer.flush().map_err(map_io)
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, NetError> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(NetError::FrameTooLarge);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(map_io)?;
    Ok(Some(body))
}
