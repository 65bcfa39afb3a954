use std::net::SocketAddr;

use std::io;

use crate::error::{Error, Result};

pub mod udp;

/// Connectionless transport the stream runs on
///
/// A single instance is shared by the listener (the only reader) and every
/// outbound call.
#[async_trait::async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `addr`
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<usize>;

    /// Receive one datagram into `buf`
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// The local address this transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Errors a datagram socket may report for an earlier send rather than the
/// current operation; the socket itself is still usable
pub(crate) fn is_transient(error: &Error) -> bool {
    match error {
        Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
        ),
        _ => false,
    }
}
