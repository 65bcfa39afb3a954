use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::codec::{Codec, JsonCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::listener::{Incoming, Listener, Src};
use crate::packet::NEW_REQUEST;
use crate::registry::{self, Registry, SELF_ENDPOINT};
use crate::send::SendEngine;
use crate::table::CorrelationTable;
use crate::transport::{udp, DatagramTransport};

/// Reliable request/response over a single datagram socket
///
/// Outbound calls can run concurrently from any number of tasks. Inbound
/// traffic, including the ACKs outbound calls wait for, is only processed
/// while some task is inside [`listen`](Self::listen) or
/// [`serve`](Self::serve).
pub struct Stream<C = JsonCodec> {
    transport: Arc<dyn DatagramTransport>,
    registry: Arc<Registry>,
    table: CorrelationTable,
    engine: SendEngine,
    listener: Listener,
    codec: C,
    config: Config,
    closed: watch::Sender<bool>,
}

impl Stream<JsonCodec> {
    /// Bind `listen` and register `endpoints` with default settings
    pub async fn bind<I, N, U>(listen: &str, endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, U)>,
        N: Into<String>,
        U: Into<String>,
    {
        endpoints
            .into_iter()
            .fold(Self::builder().bind(listen), |builder, (name, url)| {
                builder.endpoint(name, url)
            })
            .build()
            .await
    }

    /// Create a builder for configuring the stream
    pub fn builder() -> StreamBuilder<JsonCodec> {
        StreamBuilder::new()
    }
}

impl<C: Codec> Stream<C> {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Number of exchanges currently waiting on the correlation table
    pub fn outstanding(&self) -> usize {
        self.table.outstanding()
    }

    /// Stop the stream
    ///
    /// A running [`listen`](Self::listen) returns `Ok(None)`, new calls fail
    /// with [`Error::ConnectionClosed`] and calls already in flight end by
    /// their own timeouts.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::info!(addr = ?self.transport.local_addr().ok(), "stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the next new inbound request
    ///
    /// Returns `Ok(None)` once the stream has been closed. A request whose
    /// payload the codec cannot decode ends this call with
    /// [`Error::Codec`]; the stream stays usable.
    pub async fn listen<T: DeserializeOwned>(&self) -> Result<Option<Incoming<T>>> {
        let Some(raw) = self.listener.next().await? else {
            return Ok(None);
        };
        let request = self.codec.decode(&raw.payload)?;
        Ok(Some(Incoming {
            request,
            src: raw.src,
            payload: raw.payload,
        }))
    }

    /// Deliver raw bytes to `endpoint`, confirming receipt only
    pub async fn write(&self, data: &[u8], endpoint: &str) -> Result<()> {
        let addr = self.registry.lookup(endpoint)?.addr;
        self.deliver(data, addr).await
    }

    /// Deliver a push message to `endpoint`
    pub async fn push<T: Serialize>(&self, push: &T, endpoint: &str) -> Result<()> {
        let addr = self.registry.lookup(endpoint)?.addr;
        let payload = self.codec.encode(push)?;
        self.deliver(&payload, addr).await
    }

    /// Deliver a request to `endpoint` without waiting for its response
    pub async fn send_request<T: Serialize>(&self, request: &T, endpoint: &str) -> Result<()> {
        let addr = self.registry.lookup(endpoint)?.addr;
        let payload = self.codec.encode(request)?;
        self.deliver(&payload, addr).await
    }

    /// Send a request to `endpoint` and wait for its response
    pub async fn request<Req, Res>(&self, request: &Req, endpoint: &str) -> Result<Res>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.ensure_open()?;
        let addr = self.registry.lookup(endpoint)?.addr;
        let payload = self.codec.encode(request)?;
        self.check_size(&payload)?;

        let (mut entry, header) = self.table.allocate_exchange(NEW_REQUEST)?;
        self.engine
            .send(&mut entry, &header.frame(&payload), addr)
            .await?;
        let response = self.engine.await_response(&mut entry).await?;
        self.codec.decode(&response)
    }

    /// Answer an inbound request
    pub async fn respond<T: Serialize>(&self, response: &T, src: &Src) -> Result<()> {
        self.ensure_open()?;
        let payload = self.codec.encode(response)?;
        self.check_size(&payload)?;

        let (mut entry, header) = self.table.allocate(src.remote_id)?;
        self.engine
            .send(&mut entry, &header.frame(&payload), src.addr)
            .await
    }

    async fn deliver(&self, payload: &[u8], addr: SocketAddr) -> Result<()> {
        self.ensure_open()?;
        self.check_size(payload)?;

        let (mut entry, header) = self.table.allocate(NEW_REQUEST)?;
        self.engine
            .send(&mut entry, &header.frame(payload), addr)
            .await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn check_size(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size() {
            return Err(Error::InvalidFrame(format!(
                "Payload too large: {} bytes (max {})",
                payload.len(),
                self.config.max_payload_size()
            )));
        }
        Ok(())
    }
}

/// Builder for configuring a [`Stream`]
pub struct StreamBuilder<C> {
    bind: Option<String>,
    endpoints: Vec<(String, String)>,
    transport: Option<Arc<dyn DatagramTransport>>,
    config: Config,
    codec: C,
}

impl StreamBuilder<JsonCodec> {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            bind: None,
            endpoints: Vec::new(),
            transport: None,
            config: Config::default(),
            codec: JsonCodec,
        }
    }
}

impl Default for StreamBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> StreamBuilder<C> {
    /// Set the local address to bind
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind = Some(addr.into());
        self
    }

    /// Register a named remote endpoint
    pub fn endpoint(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.push((name.into(), url.into()));
        self
    }

    /// Run on an existing transport instead of binding a UDP socket
    pub fn transport(mut self, transport: impl DatagramTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Replace the whole config
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum datagram size
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    /// Set the per-attempt ACK timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the number of send attempts
    pub fn write_retry_limit(mut self, limit: u32) -> Self {
        self.config.write_retry_limit = limit;
        self
    }

    /// Set the response timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the correlation table capacity
    pub fn table_capacity(mut self, capacity: u32) -> Self {
        self.config.table_capacity = capacity;
        self
    }

    /// Use a different payload codec
    pub fn codec<D: Codec>(self, codec: D) -> StreamBuilder<D> {
        StreamBuilder {
            bind: self.bind,
            endpoints: self.endpoints,
            transport: self.transport,
            config: self.config,
            codec,
        }
    }

    /// Bind, resolve every endpoint and build the stream
    pub async fn build(self) -> Result<Stream<C>> {
        self.config.validate()?;

        let transport: Arc<dyn DatagramTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let url = self
                    .bind
                    .ok_or_else(|| Error::InvalidConfig("Bind address not set".to_string()))?;
                let addr = registry::resolve(&url).await?;
                Arc::new(udp::bind(addr).await?)
            }
        };

        let mut registry = Registry::new();
        for (name, url) in &self.endpoints {
            registry.register(name.clone(), url).await?;
        }
        registry.insert(SELF_ENDPOINT, reachable(transport.local_addr()?));
        let registry = Arc::new(registry);

        let table = CorrelationTable::new(self.config.table_capacity);
        let (closed, closed_rx) = watch::channel(false);
        let listener = Listener::new(
            Arc::clone(&transport),
            table.clone(),
            Arc::clone(&registry),
            self.config.max_packet_size,
            closed_rx,
        );

        Ok(Stream {
            engine: SendEngine::new(Arc::clone(&transport), &self.config),
            transport,
            registry,
            table,
            listener,
            codec: self.codec,
            config: self.config,
            closed,
        })
    }
}

/// A wildcard bind address is reached through loopback
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
