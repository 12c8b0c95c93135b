use std::io;

use thiserror::Error;

/// Errors surfaced by the connection protocol.
///
/// NB: Whether an error terminates a loop depends on where it happens: a [ConnError::MalformedFrame]
///      is dropped by the shared server socket's demultiplexer, but it terminates a client's read
///      loop since a dedicated socket serves a single peer.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The datagram is shorter than the header implied by its type byte, its type byte is
    ///  unknown, or its length field points past the end of the buffer
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("payload of {payload_len} bytes does not fit into a datagram of at most {max_datagram_size} bytes")]
    PayloadTooLarge {
        payload_len: usize,
        max_datagram_size: usize,
    },

    /// Socket read or write failure. Reconnection policy is up to the owner of the connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Attempt to send or enqueue on a connection after `close()` took effect
    #[error("connection closed")]
    ConnectionClosed,
}

impl ConnError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ConnError::ConnectionClosed)
    }
}
