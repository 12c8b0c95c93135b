use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::ConnConfig;
use crate::connection::{BindOutcome, Connection};
use crate::error::ConnError;
use crate::frame::Frame;
use crate::peer_key::PeerKey;
use crate::registry::ConnectionRegistry;

/// Applies a frame received on the shared socket to the per-peer connection it belongs to.
///
/// Errors are write failures for the replies (ACK, PONG); delivery to a closed inbound queue
///  is not an error, the payload is acknowledged and dropped. So is a resent data frame.
pub async fn dispatch_frame(connection: &Arc<Connection>, frame: Frame, registry: &dyn ConnectionRegistry) -> Result<(), ConnError> {
    match frame {
        Frame::Ack { sequence } => {
            connection.on_ack_received(sequence).await;
        }
        Frame::Ping => connection.pong().await?,
        Frame::Pong => trace!("received PONG from {:?}", connection.peer_addr()),
        Frame::Normal { sequence, payload } => connection.on_data_received(sequence, payload).await?,
        Frame::Register { sequence, payload } => {
            connection.acknowledge(sequence).await?;
            on_registration(connection, PeerKey::new(payload), registry).await;
        }
        Frame::Fec { .. } | Frame::Syn | Frame::Fin => {
            trace!("received {:?} frame from {:?} - not acted upon", frame.frame_type(), connection.peer_addr());
        }
    }

    connection.touch_activity().await;
    Ok(())
}

async fn on_registration(connection: &Arc<Connection>, key: PeerKey, registry: &dyn ConnectionRegistry) {
    let policy = connection.config().registration_policy;
    let key_hex = key.hex();

    match connection.bind_peer_key(key, policy).await {
        BindOutcome::Bound => {
            registry.register(&key_hex, connection.clone()).await;
        }
        BindOutcome::Unchanged => {
            trace!("repeated registration of {} from {:?}", key_hex, connection.peer_addr());
            return;
        }
        BindOutcome::Rejected { bound } => {
            warn!("{:?} is bound to {} - rejecting registration as {}", connection.peer_addr(), bound, key_hex);
            return;
        }
        BindOutcome::Rebound { previous } => {
            info!("{:?} re-registered from {} to {}", connection.peer_addr(), previous, key_hex);
            registry.unregister(Some(&previous.hex()), connection).await;
            registry.register(&key_hex, connection.clone()).await;
        }
    }

    // NB: a concurrent close() may have unregistered before the registration above
    if connection.is_closed() {
        registry.unregister(Some(&key_hex), connection).await;
    }
}

/// Owns the listening socket of a server, routing every datagram to the connection for its
///  source address and dispatching it there.
pub struct Demultiplexer {
    socket: Arc<UdpSocket>,
    registry: Arc<dyn ConnectionRegistry>,
    config: Arc<ConnConfig>,
}

impl Demultiplexer {
    pub async fn bind(addr: impl ToSocketAddrs, registry: Arc<dyn ConnectionRegistry>, config: Arc<ConnConfig>) -> anyhow::Result<Demultiplexer> {
        config.validate()?;

        let socket = UdpSocket::bind(addr).await?;
        info!("bound listening socket to {:?}", socket.local_addr()?);
        Ok(Demultiplexer::new(socket, registry, config))
    }

    pub fn new(socket: UdpSocket, registry: Arc<dyn ConnectionRegistry>, config: Arc<ConnConfig>) -> Demultiplexer {
        Demultiplexer {
            socket: Arc::new(socket),
            registry,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Receives datagrams until the socket fails. A read timeout closes the inbound queue of the
    ///  peer that sent the most recent datagram (if its connection is still open) and does not
    ///  terminate the loop.
    pub async fn recv_loop(&self) -> Result<(), ConnError> {
        info!("starting receive loop on {:?}", self.socket.local_addr());

        let mut buf = vec![0u8; self.config.max_datagram_size];
        let mut most_recent_peer = None;
        loop {
            let received = match self.config.read_timeout {
                None => self.socket.recv_from(&mut buf).await,
                Some(read_timeout) => match timeout(read_timeout, self.socket.recv_from(&mut buf)).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.on_read_timeout(most_recent_peer.take()).await;
                        continue;
                    }
                },
            };

            let (num_read, from) = received
                .inspect_err(|e| error!("socket error: {}", e))?;
            most_recent_peer = Some(from);

            self.on_datagram(&buf[..num_read], from)
                .instrument(span!(Level::TRACE, "datagram_received", ?from))
                .await;
        }
    }

    async fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        trace!("received datagram: {:?}", datagram);

        // decoding first means that garbage never creates a connection
        let frame = match Frame::deser(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("received unparseable datagram from {:?}, dropping: {}", from, e);
                return;
            }
        };

        let connection = self.registry.resolve_or_create(&self.socket, from).await;
        if let Err(e) = dispatch_frame(&connection, frame, self.registry.as_ref()).await {
            warn!("replying to {:?} failed: {} - closing connection", from, e);
            connection.close().await;
        }
    }

    async fn on_read_timeout(&self, peer_addr: Option<SocketAddr>) {
        let Some(peer_addr) = peer_addr else {
            trace!("read timeout with no recent peer");
            return;
        };

        match self.registry.lookup(peer_addr).await {
            Some(connection) => {
                debug!("read timeout - closing inbound queue of {:?}", peer_addr);
                connection.close_inbound().await;
            }
            None => trace!("read timeout for {:?} which has no open connection", peer_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::sync::mpsc;
    use crate::client::ClientConnection;
    use crate::config::RegistrationPolicy;
    use crate::registry::ConnectionTable;
    use crate::test_util::{test_config, RecordingRegistry, RecordingSocket};

    fn connection_with(socket: &Arc<RecordingSocket>, registry: &Arc<RecordingRegistry>) -> Arc<Connection> {
        Connection::new(test_config(), socket.clone(), Some(registry.as_weak()))
    }

    #[tokio::test]
    async fn test_normal_is_acknowledged_and_delivered() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();

        dispatch_frame(&connection, Frame::Normal { sequence: 5, payload: Bytes::from_static(b"abc") }, registry.as_ref()).await.unwrap();

        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 5 }]);
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn test_ack_is_sent_before_delivery() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();

        // the first payload fills the inbound queue
        dispatch_frame(&connection, Frame::Normal { sequence: 1, payload: Bytes::from_static(b"1") }, registry.as_ref()).await.unwrap();

        let blocked = {
            let connection = connection.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                dispatch_frame(&connection, Frame::Normal { sequence: 2, payload: Bytes::from_static(b"2") }, registry.as_ref()).await
            })
        };
        while socket.sent().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 1 }, Frame::Ack { sequence: 2 }]);
        assert!(!blocked.is_finished());

        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"2")));
        blocked.await.unwrap().unwrap();
        assert_eq!(socket.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_dispatch() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();

        dispatch_frame(&connection, Frame::Normal { sequence: 1, payload: Bytes::from_static(b"1") }, registry.as_ref()).await.unwrap();
        let blocked = {
            let connection = connection.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                dispatch_frame(&connection, Frame::Normal { sequence: 2, payload: Bytes::from_static(b"2") }, registry.as_ref()).await
            })
        };
        while socket.sent().len() < 2 {
            tokio::task::yield_now().await;
        }

        connection.close().await;
        timeout(Duration::from_secs(2), blocked).await.unwrap().unwrap().unwrap();

        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_resent_normal_frame_is_delivered_once() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();

        for _ in 0..2 {
            dispatch_frame(&connection, Frame::Normal { sequence: 7, payload: Bytes::from_static(b"pay") }, registry.as_ref()).await.unwrap();
        }

        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 7 }, Frame::Ack { sequence: 7 }]);
        assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"pay")));
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_for_closed_inbound_is_acknowledged_and_dropped() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        connection.close_inbound().await;

        dispatch_frame(&connection, Frame::Normal { sequence: 9, payload: Bytes::from_static(b"late") }, registry.as_ref()).await.unwrap();
        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 9 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_yields_single_pong_without_state_change() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        connection.send(Bytes::from_static(b"pending")).await.unwrap();
        let mut inbound = connection.take_inbound().await.unwrap();
        let created = connection.last_activity().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        dispatch_frame(&connection, Frame::Ping, registry.as_ref()).await.unwrap();

        assert_eq!(socket.sent_frames()[1..], [Frame::Pong]);
        assert_eq!(connection.pending_sends().await, 1);
        assert_eq!(connection.peer_key().await, None);
        assert!(inbound.try_recv().is_err());
        assert!(registry.registered().is_empty());
        assert!(!connection.is_closed());
        assert_eq!(connection.last_activity().await - created, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_ack_clears_pending_send() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let sequence = connection.send(Bytes::from_static(b"x")).await.unwrap();

        dispatch_frame(&connection, Frame::Ack { sequence }, registry.as_ref()).await.unwrap();
        dispatch_frame(&connection, Frame::Ack { sequence }, registry.as_ref()).await.unwrap();
        assert_eq!(connection.pending_sends().await, 0);
        assert_eq!(socket.sent().len(), 1);
    }

    #[rstest]
    #[case::pong(Frame::Pong)]
    #[case::fec(Frame::Fec { sequence: 1, payload: Bytes::from_static(b"parity") })]
    #[case::syn(Frame::Syn)]
    #[case::fin(Frame::Fin)]
    #[tokio::test(start_paused = true)]
    async fn test_frames_without_action_only_touch_activity(#[case] frame: Frame) {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();
        let created = connection.last_activity().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        dispatch_frame(&connection, frame, registry.as_ref()).await.unwrap();

        assert!(socket.sent().is_empty());
        assert!(inbound.try_recv().is_err());
        assert!(!connection.is_closed());
        assert_eq!(connection.last_activity().await - created, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_registration_binds_and_registers() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        let mut inbound = connection.take_inbound().await.unwrap();

        dispatch_frame(&connection, Frame::Register { sequence: 1, payload: Bytes::from_static(&[0x0a, 0x0b]) }, registry.as_ref()).await.unwrap();

        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 1 }]);
        assert_eq!(connection.peer_key().await, Some(PeerKey::new(vec![0x0a, 0x0b])));
        assert_eq!(registry.registered_keys(), vec!["0a0b".to_string()]);
        assert!(Arc::ptr_eq(&registry.registered()[0].1, &connection));
        // the key is not a payload
        assert!(inbound.try_recv().is_err());
    }

    #[rstest]
    #[case::first_bind_wins(RegistrationPolicy::FirstBindWins, vec!["01"], vec![], vec![1])]
    #[case::last_bind_wins(RegistrationPolicy::LastBindWins, vec!["01", "02"], vec![Some("01".to_string())], vec![2])]
    #[tokio::test]
    async fn test_second_registration(
        #[case] policy: RegistrationPolicy,
        #[case] expected_registered: Vec<&str>,
        #[case] expected_unregistered: Vec<Option<String>>,
        #[case] expected_key: Vec<u8>,
    ) {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let config = Arc::new(ConnConfig {
            registration_policy: policy,
            ..(*test_config()).clone()
        });
        let connection = Connection::new(config, socket.clone(), Some(registry.as_weak()));

        dispatch_frame(&connection, Frame::Register { sequence: 1, payload: Bytes::from_static(&[1]) }, registry.as_ref()).await.unwrap();
        dispatch_frame(&connection, Frame::Register { sequence: 2, payload: Bytes::from_static(&[1]) }, registry.as_ref()).await.unwrap();
        dispatch_frame(&connection, Frame::Register { sequence: 3, payload: Bytes::from_static(&[2]) }, registry.as_ref()).await.unwrap();

        // every registration frame is acknowledged, whatever the outcome
        assert_eq!(socket.sent_frames(), vec![Frame::Ack { sequence: 1 }, Frame::Ack { sequence: 2 }, Frame::Ack { sequence: 3 }]);
        assert_eq!(registry.registered_keys(), expected_registered);
        assert_eq!(registry.unregistered(), expected_unregistered);
        assert_eq!(connection.peer_key().await, Some(PeerKey::new(expected_key)));
    }

    #[tokio::test]
    async fn test_registration_on_closed_connection_is_undone() {
        let socket = RecordingSocket::new();
        let registry = RecordingRegistry::new();
        let connection = connection_with(&socket, &registry);
        connection.close().await;

        dispatch_frame(&connection, Frame::Register { sequence: 1, payload: Bytes::from_static(&[0xff]) }, registry.as_ref()).await
            .unwrap();
        assert_eq!(registry.registered_keys(), vec!["ff".to_string()]);
        assert_eq!(registry.unregistered(), vec![None, Some("ff".to_string())]);
    }

    struct Server {
        table: Arc<ConnectionTable>,
        accepted: mpsc::UnboundedReceiver<Arc<Connection>>,
        addr: SocketAddr,
        recv_loop: tokio::task::JoinHandle<Result<(), ConnError>>,
    }

    impl Server {
        async fn start(config: Arc<ConnConfig>) -> Server {
            let (table, accepted) = ConnectionTable::new(config.clone());
            let demultiplexer = Demultiplexer::bind("127.0.0.1:0", table.clone(), config).await.unwrap();
            let addr = demultiplexer.local_addr().unwrap();
            let recv_loop = tokio::spawn(async move { demultiplexer.recv_loop().await });
            Server { table, accepted, addr, recv_loop }
        }

        async fn next_accepted(&mut self) -> Arc<Connection> {
            timeout(Duration::from_secs(5), self.accepted.recv()).await
                .unwrap()
                .unwrap()
        }
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(5), async {
            while !condition().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    async fn start_client(server_addr: SocketAddr, config: Arc<ConnConfig>) -> (Arc<ClientConnection>, tokio::task::JoinHandle<Result<(), ConnError>>) {
        let client = Arc::new(ClientConnection::connect(server_addr, config).await.unwrap());
        let read_loop = {
            let client = client.clone();
            tokio::spawn(async move { client.read_loop().await })
        };
        (client, read_loop)
    }

    #[tokio::test]
    async fn test_end_to_end_registration_and_send() {
        let mut server = Server::start(test_config()).await;
        let (client, client_read_loop) = start_client(server.addr, test_config()).await;
        let key = PeerKey::new(vec![0xca, 0xfe]);

        assert_eq!(client.send_registration(&key).await.unwrap(), 1);
        let server_connection = server.next_accepted().await;
        let mut server_inbound = server_connection.take_inbound().await.unwrap();

        let table = server.table.clone();
        eventually(|| {
            let table = table.clone();
            async move { table.lookup_by_key("cafe").await.is_some() }
        }).await;
        assert!(Arc::ptr_eq(&server.table.lookup_by_key("cafe").await.unwrap(), &server_connection));
        assert_eq!(server_connection.peer_key().await, Some(key));
        assert_eq!(server_connection.peer_addr(), Some(client.local_addr().unwrap()));

        let client_connection = client.connection().clone();
        eventually(|| {
            let connection = client_connection.clone();
            async move { connection.pending_sends().await == 0 }
        }).await;

        assert_eq!(client.connection().send(Bytes::from_static(b"hello")).await.unwrap(), 2);
        assert_eq!(timeout(Duration::from_secs(5), server_inbound.recv()).await.unwrap(), Some(Bytes::from_static(b"hello")));
        eventually(|| {
            let connection = client_connection.clone();
            async move { connection.pending_sends().await == 0 }
        }).await;

        client.connection().close().await;
        client_read_loop.await.unwrap().unwrap();
        server.recv_loop.abort();
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let server = Server::start(test_config()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer.send_to(&[0x01, 0, 0, 0, 1, 0, 0, 0, 9, b'x'], server.addr).await.unwrap();
        peer.send_to(&[0x42], server.addr).await.unwrap();
        peer.send_to(&[0x81], server.addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(Frame::deser(&buf[..n]).unwrap(), Frame::Pong);

        assert_eq!(server.table.len().await, 1);
        assert!(!server.recv_loop.is_finished());
        server.recv_loop.abort();
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_inbound_only() {
        let server_config = Arc::new(ConnConfig {
            read_timeout: Some(Duration::from_millis(200)),
            ..(*test_config()).clone()
        });
        let mut server = Server::start(server_config).await;
        let (client, _client_read_loop) = start_client(server.addr, test_config()).await;
        let key = PeerKey::new(vec![0x11]);

        client.send_registration(&key).await.unwrap();
        let server_connection = server.next_accepted().await;
        let mut server_inbound = server_connection.take_inbound().await.unwrap();
        client.connection().send(Bytes::from_static(b"before")).await.unwrap();
        assert_eq!(timeout(Duration::from_secs(5), server_inbound.recv()).await.unwrap(), Some(Bytes::from_static(b"before")));

        // the client stays silent, so the read deadline passes
        assert_eq!(timeout(Duration::from_secs(5), server_inbound.recv()).await.unwrap(), None);

        assert!(!server_connection.is_closed());
        assert!(Arc::ptr_eq(&server.table.lookup_by_key("11").await.unwrap(), &server_connection));
        assert!(Arc::ptr_eq(&server.table.lookup_by_addr(client.local_addr().unwrap()).await.unwrap(), &server_connection));
        assert!(!server.recv_loop.is_finished());

        // later traffic is still acknowledged
        let client_connection = client.connection().clone();
        client.connection().send(Bytes::from_static(b"after")).await.unwrap();
        eventually(|| {
            let connection = client_connection.clone();
            async move { connection.pending_sends().await == 0 }
        }).await;

        client.connection().close().await;
        server.recv_loop.abort();
    }

    #[tokio::test]
    async fn test_read_timeout_after_close_creates_no_connection() {
        let server_config = Arc::new(ConnConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..(*test_config()).clone()
        });
        let mut server = Server::start(server_config).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer.send_to(&[0x81], server.addr).await.unwrap();
        let mut buf = [0u8; 16];
        timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();

        // the owner closes the connection on its own, before the read deadline passes
        let connection = server.next_accepted().await;
        connection.close().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(server.accepted.try_recv().is_err());
        assert!(server.table.is_empty().await);
        assert!(!server.recv_loop.is_finished());
        server.recv_loop.abort();
    }
}
