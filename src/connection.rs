mod pending;
mod received;
mod write_loop;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::{ConnConfig, RegistrationPolicy};
use crate::error::ConnError;
use crate::frame::{Frame, FrameType, DATA_HEADER_LEN};
use crate::peer_key::PeerKey;
use crate::registry::ConnectionRegistry;
use crate::send_socket::SendSocket;
use pending::PendingSends;
use received::ReceivedSequences;

/// A unit of work for the write loop. Fragments are concatenated and sent as a single frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outbound {
    Single(Bytes),
    Fragments(Vec<Bytes>),
}

impl Outbound {
    /// the length of the payload this item turns into
    pub fn payload_len(&self) -> usize {
        match self {
            Outbound::Single(payload) => payload.len(),
            Outbound::Fragments(fragments) => fragments.iter().map(|f| f.len()).sum(),
        }
    }
}

/// Result of binding a peer key received in a registration frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BindOutcome {
    /// the connection had no key before
    Bound,
    /// the same key was bound already
    Unchanged,
    /// a different key is bound, and the policy keeps it
    Rejected { bound: PeerKey },
    /// a different key was bound and got replaced
    Rebound { previous: PeerKey },
}

struct ConnectionFields {
    last_activity: Instant,
    peer_key: Option<PeerKey>,
}

/// The state of one logical peer connection, shared between its read path and its write path.
///
/// Both roles use the same state: a client owns a connection over a dedicated socket, server-side
///  connections share the listening socket and are created by a [ConnectionRegistry].
///
/// NB: `closed` flips exactly once. After that, sends fail with [ConnError::ConnectionClosed],
///      both queues are at end-of-stream, and the connection is never reused for another peer.
pub struct Connection {
    config: Arc<ConnConfig>,
    socket: Arc<dyn SendSocket>,
    registry: Option<Weak<dyn ConnectionRegistry>>,

    sequence: AtomicU32,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,

    fields: RwLock<ConnectionFields>,
    pending: Mutex<PendingSends>,
    received: Mutex<ReceivedSequences>,

    inbound_sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
    outbound_sender: Mutex<Option<mpsc::Sender<Outbound>>>,
    outbound_receiver: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

impl Connection {
    pub fn new(
        config: Arc<ConnConfig>,
        socket: Arc<dyn SendSocket>,
        registry: Option<Weak<dyn ConnectionRegistry>>,
    ) -> Arc<Connection> {
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_queue_size);
        let (outbound_sender, outbound_receiver) = mpsc::channel(config.outbound_queue_size);
        let received = ReceivedSequences::new(config.duplicate_window);

        Arc::new(Connection {
            config,
            socket,
            registry,
            sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            closed_signal: watch::channel(false).0,
            fields: RwLock::new(ConnectionFields {
                last_activity: Instant::now(),
                peer_key: None,
            }),
            pending: Default::default(),
            received: Mutex::new(received),
            inbound_sender: Mutex::new(Some(inbound_sender)),
            inbound_receiver: Mutex::new(Some(inbound_receiver)),
            outbound_sender: Mutex::new(Some(outbound_sender)),
            outbound_receiver: Mutex::new(Some(outbound_receiver)),
        })
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed
    pub async fn wait_closed(&self) {
        let mut closed = self.closed_signal.subscribe();
        closed.wait_for(|is_closed| *is_closed).await.ok();
    }

    pub async fn peer_key(&self) -> Option<PeerKey> {
        self.fields.read().await.peer_key.clone()
    }

    pub async fn last_activity(&self) -> Instant {
        self.fields.read().await.last_activity
    }

    pub async fn touch_activity(&self) {
        self.fields.write().await.last_activity = Instant::now();
    }

    /// number of sent data / registration frames that were not acknowledged yet
    pub async fn pending_sends(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, sequence: u32) -> bool {
        self.pending.lock().await.contains(sequence)
    }

    /// Hands out the receiving end of the inbound queue. This works once, later calls return `None`.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_receiver.lock().await.take()
    }

    /// Enqueues work for the write loop, waiting for queue capacity. Closing the connection
    ///  cancels the wait.
    pub async fn enqueue(&self, item: Outbound) -> Result<(), ConnError> {
        if item.payload_len() > self.config.max_payload_len() {
            return Err(ConnError::PayloadTooLarge {
                payload_len: item.payload_len(),
                max_datagram_size: self.config.max_datagram_size,
            });
        }

        let sender = self.outbound_sender.lock().await
            .clone()
            .ok_or(ConnError::ConnectionClosed)?;
        select! {
            _ = self.wait_closed() => Err(ConnError::ConnectionClosed),
            result = sender.send(item) => result.map_err(|_| ConnError::ConnectionClosed),
        }
    }

    /// Sends a payload as a NORMAL frame, returning its sequence number. The frame is tracked as
    ///  pending until the peer acknowledges it.
    pub async fn send(&self, payload: Bytes) -> Result<u32, ConnError> {
        self.send_sequenced(FrameType::Normal, payload).await
    }

    /// Concatenates fragments into a single payload and sends it as one NORMAL frame
    pub async fn send_fragments(&self, fragments: &[Bytes]) -> Result<u32, ConnError> {
        let mut payload = BytesMut::with_capacity(fragments.iter().map(|f| f.len()).sum());
        for fragment in fragments {
            payload.put_slice(fragment);
        }
        self.send(payload.freeze()).await
    }

    /// Announces this side's identity to the peer
    pub async fn send_registration(&self, key: &PeerKey) -> Result<u32, ConnError> {
        self.send_sequenced(FrameType::Register, key.as_bytes().clone()).await
    }

    async fn send_sequenced(&self, frame_type: FrameType, payload: Bytes) -> Result<u32, ConnError> {
        if DATA_HEADER_LEN + payload.len() > self.config.max_datagram_size {
            return Err(ConnError::PayloadTooLarge {
                payload_len: payload.len(),
                max_datagram_size: self.config.max_datagram_size,
            });
        }

        // NB: close() clears the pending table under this lock after flipping `closed`, so
        //      checking the flag while holding it means no entry or datagram outlives the close
        let mut pending = self.pending.lock().await;
        if self.is_closed() {
            return Err(ConnError::ConnectionClosed);
        }

        // NB: wrap-around after 2^32 frames is accepted
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let frame = match frame_type {
            FrameType::Register => Frame::Register { sequence, payload },
            _ => Frame::Normal { sequence, payload },
        };
        let packet = frame.encode(self.config.max_datagram_size)?;

        // registered before writing so that an ACK can not overtake the bookkeeping
        pending.insert(sequence, packet.clone(), Instant::now(), self.config.retransmit.as_ref());

        trace!("sending {:?} #{} to {:?}", frame_type, sequence, self.peer_addr());
        self.socket.do_send_packet(&packet).await?;
        Ok(sequence)
    }

    /// Confirms receipt of a data or registration frame
    pub async fn acknowledge(&self, sequence: u32) -> Result<(), ConnError> {
        trace!("acknowledging #{} to {:?}", sequence, self.peer_addr());
        self.write_frame(&Frame::Ack { sequence }).await
    }

    /// Handles a received data frame: it is always acknowledged (again, if the peer resent it),
    ///  and its payload is delivered unless the sequence number was seen recently. Payloads that
    ///  can not be delivered because the inbound queue is closed are dropped.
    pub async fn on_data_received(&self, sequence: u32, payload: Bytes) -> Result<(), ConnError> {
        self.acknowledge(sequence).await?;

        if !self.received.lock().await.insert(sequence) {
            debug!("duplicate #{} from {:?} - acknowledged, not delivered", sequence, self.peer_addr());
            return Ok(());
        }
        if self.deliver(payload).await.is_err() {
            debug!("inbound queue for {:?} is closed - dropping payload #{}", self.peer_addr(), sequence);
        }
        Ok(())
    }

    /// Clears a pending send. Unknown and duplicate sequence numbers are ignored, the return
    ///  value tells whether the sequence number was pending.
    pub async fn on_ack_received(&self, sequence: u32) -> bool {
        let removed = self.pending.lock().await.remove(sequence);
        if !removed {
            trace!("ACK for #{} which is not pending - ignoring", sequence);
        }
        removed
    }

    pub async fn ping(&self) -> Result<(), ConnError> {
        self.write_frame(&Frame::Ping).await
    }

    pub async fn pong(&self) -> Result<(), ConnError> {
        self.write_frame(&Frame::Pong).await
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), ConnError> {
        let packet = frame.encode(self.config.max_datagram_size)?;
        self.socket.do_send_packet(&packet).await?;
        Ok(())
    }

    /// Resends pending frames whose acknowledgement is overdue, dropping those that exhausted
    ///  their retransmit attempts
    pub async fn resend_overdue(&self) -> Result<(), ConnError> {
        let Some(retransmit) = &self.config.retransmit else {
            return Ok(());
        };

        let overdue = self.pending.lock().await
            .take_overdue(Instant::now(), retransmit);

        for sequence in overdue.given_up {
            warn!("giving up on #{} to {:?} after {} resends", sequence, self.peer_addr(), retransmit.max_attempts);
        }
        for (sequence, packet) in overdue.resend {
            debug!("resending #{} to {:?}", sequence, self.peer_addr());
            self.socket.do_send_packet(&packet).await?;
        }
        Ok(())
    }

    /// Hands a received payload to the connection's owner, waiting until there is room in the
    ///  inbound queue. Fails if the inbound queue is closed, also while waiting.
    pub async fn deliver(&self, payload: Bytes) -> Result<(), ConnError> {
        let sender = self.inbound_sender.lock().await
            .clone()
            .ok_or(ConnError::ConnectionClosed)?;

        let permit = select! {
            _ = self.wait_closed() => return Err(ConnError::ConnectionClosed),
            permit = sender.reserve() => permit.map_err(|_| ConnError::ConnectionClosed)?,
        };

        // NB: close() and close_inbound() take the stored sender under this lock, so nothing
        //      is pushed once either of them has returned
        let stored = self.inbound_sender.lock().await;
        if stored.is_none() || self.is_closed() {
            return Err(ConnError::ConnectionClosed);
        }
        permit.send(payload);
        Ok(())
    }

    /// Closes only the inbound queue, signalling the owner that no more input will arrive. The
    ///  connection stays open for sending and stays registered.
    pub async fn close_inbound(&self) {
        if self.inbound_sender.lock().await.take().is_some() {
            debug!("closed inbound queue for {:?}", self.peer_addr());
        }
    }

    pub async fn bind_peer_key(&self, key: PeerKey, policy: RegistrationPolicy) -> BindOutcome {
        let mut fields = self.fields.write().await;

        match &fields.peer_key {
            None => {
                fields.peer_key = Some(key);
                BindOutcome::Bound
            }
            Some(bound) if bound == &key => BindOutcome::Unchanged,
            Some(bound) => match policy {
                RegistrationPolicy::FirstBindWins => BindOutcome::Rejected { bound: bound.clone() },
                RegistrationPolicy::LastBindWins => {
                    let previous = bound.clone();
                    fields.peer_key = Some(key);
                    BindOutcome::Rebound { previous }
                }
            },
        }
    }

    /// Closes the connection. This is idempotent and safe to call concurrently from the read path,
    ///  the write path and the owner - only the first call has an effect.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            trace!("closing closed connection - ignoring");
            return;
        }

        debug!("closing connection to {:?}", self.peer_addr());
        self.closed_signal.send_replace(true);

        self.inbound_sender.lock().await.take();
        self.outbound_sender.lock().await.take();
        // untaken receivers go too, which fails senders that are blocked on a full queue
        self.inbound_receiver.lock().await.take();
        self.outbound_receiver.lock().await.take();
        self.pending.lock().await.clear();

        let key_hex = self.peer_key().await.map(|key| key.hex());
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.unregister(key_hex.as_deref(), self).await;
        }
    }
}
