use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::transport::DatagramTransport;

/// Bind a UDP socket for a stream
pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    tracing::info!(addr = %socket.local_addr()?, "udp socket bound");
    Ok(socket)
}

#[async_trait::async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(UdpSocket::send_to(self, bytes, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        UdpSocket::local_addr(self).map_err(Into::into)
    }
}
