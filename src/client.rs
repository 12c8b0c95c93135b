use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, error, info, trace, warn};
use crate::config::ConnConfig;
use crate::connection::Connection;
use crate::error::ConnError;
use crate::frame::Frame;
use crate::peer_key::PeerKey;
use crate::registry::ConnectionRegistry;
use crate::send_socket::ConnectedSocket;

/// A connection to a single peer over a dedicated, connected UDP socket.
///
/// The owner drives it by running [ClientConnection::read_loop] and [ClientConnection::write_loop]
///  concurrently, sending through [Connection::enqueue] and receiving from [Connection::take_inbound].
pub struct ClientConnection {
    socket: Arc<UdpSocket>,
    connection: Arc<Connection>,
}

impl ClientConnection {
    pub async fn connect(remote: SocketAddr, config: Arc<ConnConfig>) -> anyhow::Result<ClientConnection> {
        config.validate()?;

        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        info!("connected socket {:?} to {:?}", socket.local_addr()?, remote);

        Ok(ClientConnection::new(socket, config, None))
    }

    /// wraps a socket that is already connected to the peer
    pub fn new(socket: UdpSocket, config: Arc<ConnConfig>, registry: Option<Weak<dyn ConnectionRegistry>>) -> ClientConnection {
        let socket = Arc::new(socket);
        let connection = Connection::new(config, Arc::new(ConnectedSocket::new(socket.clone())), registry);
        ClientConnection {
            socket,
            connection,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_registration(&self, key: &PeerKey) -> Result<u32, ConnError> {
        debug!("registering as {}", key);
        self.connection.send_registration(key).await
    }

    pub async fn write_loop(&self) -> Result<(), ConnError> {
        self.connection.write_loop().await
    }

    /// Reads and dispatches datagrams until the connection is closed (returning `Ok`) or the
    ///  socket fails. Since the socket serves a single peer, a malformed datagram is treated as
    ///  fatal for the connection as well.
    pub async fn read_loop(&self) -> Result<(), ConnError> {
        debug!("starting read loop for {:?}", self.connection.peer_addr());

        let mut buf = vec![0u8; self.connection.config().max_datagram_size];
        loop {
            let num_read = select! {
                _ = self.connection.wait_closed() => {
                    debug!("connection closed - terminating read loop");
                    return Ok(());
                }
                received = self.socket.recv(&mut buf) => {
                    received.inspect_err(|e| error!("socket error: {}", e))?
                }
            };

            let datagram = &buf[..num_read];
            trace!("received datagram: {:?}", datagram);

            let frame = Frame::deser(datagram)
                .inspect_err(|e| warn!("received unparseable datagram from {:?}: {}", self.connection.peer_addr(), e))?;
            self.on_frame(frame).await?;
        }
    }

    async fn on_frame(&self, frame: Frame) -> Result<(), ConnError> {
        let connection = &self.connection;

        match frame {
            Frame::Ack { sequence } => {
                connection.on_ack_received(sequence).await;
            }
            Frame::Normal { sequence, payload } => connection.on_data_received(sequence, payload).await?,
            Frame::Ping => connection.pong().await?,
            Frame::Pong => trace!("received PONG"),
            Frame::Register { sequence, .. } => {
                warn!("peer {:?} sent a registration frame (#{}) to a client - ignoring", connection.peer_addr(), sequence);
            }
            Frame::Fec { .. } | Frame::Syn | Frame::Fin => {
                trace!("received {:?} frame - not acted upon", frame.frame_type());
            }
        }

        connection.touch_activity().await;
        Ok(())
    }
}
