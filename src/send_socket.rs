use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for writing a datagram to a single peer, introduced to decouple
///  connections from the two socket flavors (a dedicated connected socket for a client, a
///  shared listening socket for server-side connections) and to facilitate mocking the I/O
///  part away for testing.
///
/// Implementations must be safe for concurrent use: the read path (ACK, PONG) and the write
///  path (data, PING) of a connection write concurrently, and server-side connections share
///  one socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A client's dedicated socket, already connected to its single peer
pub struct ConnectedSocket {
    socket: Arc<UdpSocket>,
}

impl ConnectedSocket {
    pub fn new(socket: Arc<UdpSocket>) -> ConnectedSocket {
        ConnectedSocket { socket }
    }
}

#[async_trait]
impl SendSocket for ConnectedSocket {
    async fn do_send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to connected peer", packet_buf.len());
        self.socket.send(packet_buf).await?;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok()
    }
}

/// One peer's view of a listening socket that is shared between all server-side connections
pub struct SharedSocket {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
}

impl SharedSocket {
    pub fn new(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> SharedSocket {
        SharedSocket { socket, peer_addr }
    }
}

#[async_trait]
impl SendSocket for SharedSocket {
    async fn do_send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), self.peer_addr);
        self.socket.send_to(packet_buf, self.peer_addr).await?;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}
