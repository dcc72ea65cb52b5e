use crate::net::channel::Channel;
use crate::net::NetError;

/// Interface for the pool connection.
///
/// A transport owns the socket and a background delivery loop: once started
/// it drains `to_pool` onto the wire and feeds every message received from
/// the pool into `from_pool`.
pub trait Transport: Send {
    /// Connect to the pool server.
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError>;

    /// Start the background delivery loop.
    fn start(&mut self, to_pool: Channel, from_pool: Channel) -> Result<(), NetError>;

    /// Whether the delivery loop is still running.
    fn is_alive(&self) -> bool;

    /// Stop delivering and unblock any I/O the loop is parked in.
    fn shutdown(&mut self);

    /// Block until the delivery loop has exited.
    fn join(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        (**self).connect(host, port)
    }

    fn start(&mut self, to_pool: Channel, from_pool: Channel) -> Result<(), NetError> {
        (**self).start(to_pool, from_pool)
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }

    fn join(&mut self) {
        (**self).join()
    }
}
