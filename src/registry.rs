use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};
use crate::config::ConnConfig;
use crate::connection::Connection;
use crate::send_socket::SharedSocket;

/// The registry maps socket addresses and peer public keys to connections. It is the
///  collaborator that decides when a connection is created; the protocol code only calls into it.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync + 'static {
    /// Returns the server-side connection for a remote address, creating it if necessary
    async fn resolve_or_create(&self, socket: &Arc<UdpSocket>, peer_addr: SocketAddr) -> Arc<Connection>;

    /// Returns the open server-side connection for a remote address without creating one
    async fn lookup(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>>;

    /// Binds a peer's public key (lowercase hex) to a connection
    async fn register(&self, key_hex: &str, connection: Arc<Connection>);

    /// Called exactly once when a connection is closed (`key_hex` is `None` if no key was ever
    ///  bound), and when a rebinding registration replaces a key.
    async fn unregister(&self, key_hex: Option<&str>, connection: &Arc<Connection>);
}

/// In-memory registry for server-side connections over one listening socket.
///
/// Every connection it creates gets its write loop spawned and is announced on the channel
///  returned by [ConnectionTable::new], which is where the application picks up new peers and
///  takes their inbound queue.
pub struct ConnectionTable {
    config: Arc<ConnConfig>,
    myself: Weak<ConnectionTable>,
    by_addr: RwLock<FxHashMap<SocketAddr, Arc<Connection>>>,
    by_key: RwLock<FxHashMap<String, Arc<Connection>>>,
    accepted: mpsc::UnboundedSender<Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new(config: Arc<ConnConfig>) -> (Arc<ConnectionTable>, mpsc::UnboundedReceiver<Arc<Connection>>) {
        let (accepted, accepted_receiver) = mpsc::unbounded_channel();

        let table = Arc::new_cyclic(|myself| ConnectionTable {
            config,
            myself: myself.clone(),
            by_addr: Default::default(),
            by_key: Default::default(),
            accepted,
        });
        (table, accepted_receiver)
    }

    pub async fn lookup_by_key(&self, key_hex: &str) -> Option<Arc<Connection>> {
        self.by_key.read().await
            .get(key_hex)
            .cloned()
    }

    pub async fn lookup_by_addr(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.by_addr.read().await
            .get(&peer_addr)
            .cloned()
    }

    /// number of connections known by address
    pub async fn len(&self) -> usize {
        self.by_addr.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn create_connection(&self, socket: &Arc<UdpSocket>, peer_addr: SocketAddr) -> Arc<Connection> {
        let registry: Weak<dyn ConnectionRegistry> = self.myself.clone();
        let connection = Connection::new(
            self.config.clone(),
            Arc::new(SharedSocket::new(socket.clone(), peer_addr)),
            Some(registry),
        );

        let write_connection = connection.clone();
        tokio::spawn(async move {
            if let Err(e) = write_connection.write_loop().await {
                warn!("write loop for {:?} terminated: {}", peer_addr, e);
                write_connection.close().await;
            }
        });

        if self.accepted.send(connection.clone()).is_err() {
            trace!("nobody is listening for new connections");
        }
        connection
    }
}

#[async_trait]
impl ConnectionRegistry for ConnectionTable {
    async fn resolve_or_create(&self, socket: &Arc<UdpSocket>, peer_addr: SocketAddr) -> Arc<Connection> {
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(connection) = self.by_addr.read().await.get(&peer_addr) {
                if !connection.is_closed() {
                    return connection.clone();
                }
            }
        }

        let mut by_addr = self.by_addr.write().await;
        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(connection) = by_addr.get(&peer_addr) {
            if !connection.is_closed() {
                return connection.clone();
            }
            debug!("replacing closed connection for {:?}", peer_addr);
        }
        else {
            debug!("creating connection for {:?}", peer_addr);
        }

        let connection = self.create_connection(socket, peer_addr);
        by_addr.insert(peer_addr, connection.clone());
        connection
    }

    async fn lookup(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.lookup_by_addr(peer_addr).await
            .filter(|connection| !connection.is_closed())
    }

    async fn register(&self, key_hex: &str, connection: Arc<Connection>) {
        debug!("registering peer {} for {:?}", key_hex, connection.peer_addr());
        if let Some(prev) = self.by_key.write().await.insert(key_hex.to_string(), connection.clone()) {
            if !Arc::ptr_eq(&prev, &connection) {
                debug!("peer {} moved from {:?} to {:?}", key_hex, prev.peer_addr(), connection.peer_addr());
            }
        }
    }

    async fn unregister(&self, key_hex: Option<&str>, connection: &Arc<Connection>) {
        if let Some(key_hex) = key_hex {
            let mut by_key = self.by_key.write().await;
            if by_key.get(key_hex).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                debug!("unregistering peer {}", key_hex);
                by_key.remove(key_hex);
            }
        }

        // a rebinding registration unregisters the old key of a live connection, which stays
        //  reachable by address
        if connection.is_closed() {
            if let Some(peer_addr) = connection.peer_addr() {
                let mut by_addr = self.by_addr.write().await;
                if by_addr.get(&peer_addr).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                    by_addr.remove(&peer_addr);
                }
            }
        }
    }
}
