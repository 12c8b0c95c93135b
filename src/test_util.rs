use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use crate::config::ConnConfig;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::registry::ConnectionRegistry;
use crate::send_socket::SendSocket;

/// default configuration without retransmission, which keeps the datagrams sent by a test
///  predictable
pub fn test_config() -> Arc<ConnConfig> {
    Arc::new(ConnConfig {
        retransmit: None,
        ..ConnConfig::default()
    })
}

pub fn test_peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9999))
}

/// Collects everything written to it, for tests that care about the sequence of datagrams
///  rather than about individual expectations
pub struct RecordingSocket {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSocket {
    pub fn new() -> Arc<RecordingSocket> {
        Arc::new(RecordingSocket {
            sent: Default::default(),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent().iter()
            .map(|buf| Frame::deser(buf).unwrap())
            .collect()
    }
}

#[async_trait]
impl SendSocket for RecordingSocket {
    async fn do_send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(packet_buf.to_vec());
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(test_peer_addr())
    }
}

/// Records `register` / `unregister` calls. It does not create connections.
pub struct RecordingRegistry {
    registered: Mutex<Vec<(String, Arc<Connection>)>>,
    unregistered: Mutex<Vec<Option<String>>>,
}

impl RecordingRegistry {
    pub fn new() -> Arc<RecordingRegistry> {
        Arc::new(RecordingRegistry {
            registered: Default::default(),
            unregistered: Default::default(),
        })
    }

    pub fn as_weak(self: &Arc<Self>) -> Weak<dyn ConnectionRegistry> {
        let registry: Arc<dyn ConnectionRegistry> = self.clone();
        Arc::downgrade(&registry)
    }

    pub fn registered_keys(&self) -> Vec<String> {
        self.registered.lock().unwrap().iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn registered(&self) -> Vec<(String, Arc<Connection>)> {
        self.registered.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<Option<String>> {
        self.unregistered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionRegistry for RecordingRegistry {
    async fn resolve_or_create(&self, _socket: &Arc<UdpSocket>, peer_addr: SocketAddr) -> Arc<Connection> {
        panic!("RecordingRegistry does not create connections (requested for {:?})", peer_addr);
    }

    async fn lookup(&self, _peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        None
    }

    async fn register(&self, key_hex: &str, connection: Arc<Connection>) {
        self.registered.lock().unwrap().push((key_hex.to_string(), connection));
    }

    async fn unregister(&self, key_hex: Option<&str>, _connection: &Arc<Connection>) {
        self.unregistered.lock().unwrap().push(key_hex.map(|k| k.to_string()));
    }
}
