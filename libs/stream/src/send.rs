use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::Delivery;
use crate::table::Entry;
use crate::transport::{is_transient, DatagramTransport};

/// Writes packets until acknowledged and waits for responses
#[derive(Clone)]
pub struct SendEngine {
    transport: Arc<dyn DatagramTransport>,
    write_timeout: Duration,
    write_retry_limit: u32,
    read_timeout: Duration,
}

impl SendEngine {
    pub fn new(transport: Arc<dyn DatagramTransport>, config: &Config) -> Self {
        Self {
            transport,
            write_timeout: config.write_timeout,
            write_retry_limit: config.write_retry_limit,
            read_timeout: config.read_timeout,
        }
    }

    /// Send `packet` to `addr` until the entry sees an ACK
    ///
    /// Each attempt writes the identical packet and waits up to the write
    /// timeout. Only missing ACKs are retried; a write the socket refuses
    /// outright is returned as is. A rejection ends the loop immediately. A response payload
    /// arriving before the ACK counts as the ACK and is kept on the entry
    /// for [`await_response`](Self::await_response).
    pub async fn send(&self, entry: &mut Entry, packet: &[u8], addr: SocketAddr) -> Result<()> {
        for attempt in 1..=self.write_retry_limit {
            match self.transport.send_to(packet, addr).await {
                Ok(_) => {}
                Err(e) if is_transient(&e) => {
                    tracing::debug!(id = entry.id(), attempt, error = %e, "datagram write failed, waiting anyway");
                }
                Err(e) => {
                    tracing::debug!(id = entry.id(), attempt, peer = %addr, error = %e, "datagram write failed");
                    return Err(e);
                }
            }

            match tokio::time::timeout(self.write_timeout, entry.recv()).await {
                Ok(Some(Delivery::Ack)) => return Ok(()),
                Ok(Some(Delivery::Reject)) => return Err(Error::Rejected { id: entry.id() }),
                Ok(Some(Delivery::Payload(payload))) => {
                    tracing::trace!(id = entry.id(), "response arrived ahead of its ACK");
                    entry.hold(payload);
                    return Ok(());
                }
                Ok(None) => return Err(Error::ConnectionClosed),
                Err(_) => {
                    tracing::debug!(id = entry.id(), attempt, peer = %addr, "no ACK, retrying");
                }
            }
        }

        Err(Error::SendTimeout {
            attempts: self.write_retry_limit,
        })
    }

    /// Wait for the response payload of an acknowledged exchange
    pub async fn await_response(&self, entry: &mut Entry) -> Result<Vec<u8>> {
        entry.advance();
        if let Some(payload) = entry.take_held() {
            return Ok(payload);
        }

        let id = entry.id();
        let wait = async {
            loop {
                match entry.recv().await {
                    Some(Delivery::Payload(payload)) => return Ok(payload),
                    Some(other) => {
                        tracing::trace!(id, kind = other.kind(), "ignoring delivery while awaiting response");
                    }
                    None => return Err(Error::ConnectionClosed),
                }
            }
        };

        tokio::time::timeout(self.read_timeout, wait)
            .await
            .map_err(|_| Error::ResponseTimeout(self.read_timeout))?
    }
}
