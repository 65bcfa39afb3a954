//! The read side of a stream.
//!
//! One listener owns the only read cursor on the transport. Every datagram
//! is classified and either routed to the correlation table, answered with
//! an echo-ACK, or handed back to the caller as a new inbound request. The
//! loop never waits on a consumer: table dispatch is a non-blocking hand-off
//! and echo-ACKs are written from spawned tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::Result;
use crate::packet::{Datagram, Delivery};
use crate::registry::Registry;
use crate::table::CorrelationTable;
use crate::transport::{is_transient, DatagramTransport};

/// Origin of an inbound request, needed to address its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Src {
    /// The requester's correlation id
    pub remote_id: u32,
    pub addr: SocketAddr,
}

/// A new inbound request as surfaced by the listener
#[derive(Debug, Clone)]
pub struct Incoming<T> {
    pub request: T,
    pub src: Src,
    /// The undecoded request payload
    pub payload: Vec<u8>,
}

/// Raw request before the codec has seen it
#[derive(Debug)]
pub(crate) struct RawRequest {
    pub src: Src,
    pub payload: Vec<u8>,
}

pub(crate) struct Listener {
    transport: Arc<dyn DatagramTransport>,
    table: CorrelationTable,
    registry: Arc<Registry>,
    max_packet_size: usize,
    buf: Mutex<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        table: CorrelationTable,
        registry: Arc<Registry>,
        max_packet_size: usize,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            table,
            registry,
            max_packet_size,
            // One spare byte so oversized datagrams are seen as such
            // instead of silently truncated.
            buf: Mutex::new(vec![0u8; max_packet_size + 1]),
            closed,
        }
    }

    /// Read until a new request arrives, or `None` once the stream is closed
    pub async fn next(&self) -> Result<Option<RawRequest>> {
        let mut buf = self.buf.lock().await;
        let mut closed = self.closed.clone();

        loop {
            let received = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Ok(None),
                received = self.transport.recv_from(&mut buf[..]) => received,
            };

            let (len, addr) = match received {
                Ok(received) => received,
                Err(_) if *closed.borrow() => return Ok(None),
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "transient socket error, continuing");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if len > self.max_packet_size {
                tracing::debug!(peer = %addr, len, "oversized datagram discarded");
                continue;
            }

            if let Some(request) = self.route(&buf[..len], addr) {
                return Ok(Some(request));
            }
        }
    }

    fn route(&self, raw: &[u8], addr: SocketAddr) -> Option<RawRequest> {
        let datagram = match Datagram::decode(raw) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::trace!(peer = %addr, error = %e, "malformed datagram discarded");
                return None;
            }
        };

        if let Some(ack) = datagram.echo_ack() {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.send_to(&ack, addr).await {
                    tracing::warn!(peer = %addr, error = %e, "echo ACK write failed");
                }
            });
        }

        match datagram {
            Datagram::Ack { target_id } => {
                self.table.dispatch(target_id, Delivery::Ack);
                None
            }
            Datagram::Control { .. } => None,
            Datagram::Request { sender_id, payload } => {
                tracing::debug!(
                    peer = %addr,
                    endpoint = self.registry.name_of(addr).unwrap_or("unregistered"),
                    remote_id = sender_id,
                    len = payload.len(),
                    "inbound request"
                );
                Some(RawRequest {
                    src: Src {
                        remote_id: sender_id,
                        addr,
                    },
                    payload: payload.to_vec(),
                })
            }
            Datagram::Correlated { header, payload } => {
                self.table
                    .dispatch(header.target_id, Delivery::from_payload(payload));
                None
            }
        }
    }
}
