use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Name under which a stream registers its own bound address
pub const SELF_ENDPOINT: &str = "listen";

/// A named remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    /// Address as it was given at registration
    pub url: String,
    pub addr: SocketAddr,
}

/// Name to address table for outbound calls
///
/// Filled while the stream is being built and read-only afterwards, so
/// lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    endpoints: HashMap<String, Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `url` and register it under `name`, replacing any previous entry
    pub async fn register(&mut self, name: impl Into<String>, url: &str) -> Result<()> {
        let addr = resolve(url).await?;
        let name = name.into();
        tracing::debug!(endpoint = %name, %addr, "registered endpoint");
        self.endpoints.insert(
            name.clone(),
            Endpoint {
                name,
                url: url.to_string(),
                addr,
            },
        );
        Ok(())
    }

    /// Register an already resolved address
    pub fn insert(&mut self, name: impl Into<String>, addr: SocketAddr) {
        let name = name.into();
        self.endpoints.insert(
            name.clone(),
            Endpoint {
                name,
                url: addr.to_string(),
                addr,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(name)
            .ok_or_else(|| Error::UnknownEndpoint(name.to_string()))
    }

    /// Reverse lookup: which registered endpoint lives at `addr`
    pub fn name_of(&self, addr: SocketAddr) -> Option<&str> {
        self.endpoints
            .values()
            .find(|endpoint| endpoint.addr == addr)
            .map(|endpoint| endpoint.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Resolve a `host:port` string, preferring IPv4
pub async fn resolve(url: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(url)
        .await
        .map_err(|source| Error::Resolve {
            address: url.to_string(),
            source,
        })?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Resolve {
            address: url.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        })
}
