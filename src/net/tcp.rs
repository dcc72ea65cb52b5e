//! TCP transport to the pool server.
//!
//! One socket, two worker threads: `pool-reader` turns frames into
//! `from_pool` payloads and `pool-writer` turns `to_pool` payloads into
//! frames. With encryption enabled a Noise XX handshake runs inside
//! `connect`, and each worker owns the cipher for its direction.

use crate::config::MixerConfig;
use crate::net::channel::{Channel, ChannelError};
use crate::net::framing::{read_frame, write_frame};
use crate::net::noise_xx::{CipherState, HandshakeState, NoiseTransport};
use crate::net::transport::Transport;
use crate::net::NetError;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use x25519_dalek::StaticSecret;

/// Settings for `TcpTransport`.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Run a Noise XX handshake and encrypt every frame.
    pub encrypt: bool,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    /// How often the writer re-checks the shutdown flag while idle.
    pub poll_interval: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::from(&MixerConfig::default())
    }
}

impl From<&MixerConfig> for TcpConfig {
    fn from(config: &MixerConfig) -> Self {
        Self {
            encrypt: config.use_transport_encryption,
            connect_timeout: config.connect_timeout(),
            max_frame_len: config.max_frame_len,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Client side of the Noise XX handshake over any framed byte stream.
pub fn handshake_as_initiator<S: Read + Write>(
    stream: &mut S,
    max_frame_len: usize,
) -> Result<NoiseTransport, NetError> {
    let mut hs = HandshakeState::initiator(HandshakeState::generate_static());
    write_frame(stream, &hs.write_message()?, max_frame_len)?;
    let msg2 = read_frame(stream, max_frame_len)?.ok_or(NetError::HandshakeFailed)?;
    hs.read_message(&msg2)?;
    write_frame(stream, &hs.write_message()?, max_frame_len)?;
    hs.into_transport()
}

/// Pool side of the Noise XX handshake.
pub fn handshake_as_responder<S: Read + Write>(
    stream: &mut S,
    static_priv: StaticSecret,
    max_frame_len: usize,
) -> Result<NoiseTransport, NetError> {
    let mut hs = HandshakeState::responder(static_priv);
    let msg1 = read_frame(stream, max_frame_len)?.ok_or(NetError::HandshakeFailed)?;
    hs.read_message(&msg1)?;
    write_frame(stream, &hs.write_message()?, max_frame_len)?;
    let msg3 = read_frame(stream, max_frame_len)?.ok_or(NetError::HandshakeFailed)?;
    hs.read_message(&msg3)?;
    hs.into_transport()
}

pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
    noise: Option<NoiseTransport>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
            noise: None,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&self, host: &str, port: u16) -> Result<TcpStream, NetError> {
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetError::InvalidAddress)?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::InvalidAddress);
        }

        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => log::debug!("Connect to {} failed: {}", addr, e),
            }
        }
        Err(NetError::ConnectionFailed)
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        if !self.workers.is_empty() {
            return Err(NetError::AlreadyStarted);
        }

        let mut stream = self.open(host, port)?;
        let _ = stream.set_nodelay(true);

        if self.config.encrypt {
            stream
                .set_read_timeout(Some(self.config.connect_timeout))
                .map_err(|_| NetError::IOError)?;
            let noise = handshake_as_initiator(&mut stream, self.config.max_frame_len)?;
            stream.set_read_timeout(None).map_err(|_| NetError::IOError)?;
            self.noise = Some(noise);
        }

        log::info!(
            "Connected to pool {}:{} (encrypted: {})",
            host,
            port,
            self.config.encrypt
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self, to_pool: Channel, from_pool: Channel) -> Result<(), NetError> {
        if !self.workers.is_empty() {
            return Err(NetError::AlreadyStarted);
        }
        let stream = self.stream.as_ref().ok_or(NetError::NotConnected)?;
        let reader_stream = stream.try_clone().map_err(|_| NetError::IOError)?;
        let writer_stream = stream.try_clone().map_err(|_| NetError::IOError)?;

        let (sender, receiver) = match self.noise.take() {
            Some(keys) => (Some(keys.sender), Some(keys.receiver)),
            None => (None, None),
        };

        self.running.store(true, Ordering::SeqCst);

        let reader = {
            let running = self.running.clone();
            let max = self.config.max_frame_len;
            thread::Builder::new()
                .name("pool-reader".into())
                .spawn(move || read_loop(reader_stream, receiver, from_pool, running, max))
                .map_err(|_| NetError::IOError)?
        };
        self.workers.push(reader);

        let writer = {
            let running = self.running.clone();
            let max = self.config.max_frame_len;
            let poll = self.config.poll_interval;
            thread::Builder::new()
                .name("pool-writer".into())
                .spawn(move || write_loop(writer_stream, sender, to_pool, running, max, poll))
        };
        match writer {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(_) => {
                self.shutdown();
                Err(NetError::IOError)
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.workers.iter().any(|h| !h.is_finished())
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn join(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("Transport worker panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn read_loop(
    mut stream: TcpStream,
    mut cipher: Option<CipherState>,
    from_pool: Channel,
    running: Arc<AtomicBool>,
    max_frame_len: usize,
) {
    loop {
        let frame = match read_frame(&mut stream, max_frame_len) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Pool closed the connection");
                break;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    log::warn!("Reading from pool failed: {}", e);
                }
                break;
            }
        };

        let message = match cipher.as_mut() {
            Some(c) => match c.decrypt(&frame) {
                Ok(plain) => plain,
                Err(e) => {
                    log::error!("Dropping connection, undecryptable frame: {}", e);
                    break;
                }
            },
            None => frame,
        };

        if from_pool.send(Some(message)).is_err() {
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
    from_pool.close();
}

fn write_loop(
    mut stream: TcpStream,
    mut cipher: Option<CipherState>,
    to_pool: Channel,
    running: Arc<AtomicBool>,
    max_frame_len: usize,
    poll_interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let message = match to_pool.recv_timeout(poll_interval) {
            Ok(Some(message)) => message,
            Ok(None) | Err(ChannelError::Timeout) => continue,
            Err(_) => break,
        };

        let frame = match cipher.as_mut() {
            Some(c) => match c.encrypt(&message) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log::error!("Cannot encrypt outgoing message: {}", e);
                    break;
                }
            },
            None => message,
        };

        if let Err(e) = write_frame(&mut stream, &frame, max_frame_len) {
            log::warn!("Writing to pool failed: {}", e);
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
}
