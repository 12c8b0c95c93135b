//! A small reliable, message-oriented transport over UDP for peer-to-peer overlays.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*: every message is one datagram, the
//!   protocol does not chunk or re-assemble
//!   * messages that consist of several fragments are concatenated and sent as a single frame
//! * A client has a dedicated socket per peer. A server multiplexes all its peers over one
//!   listening socket, a [server::Demultiplexer] routes datagrams by source address
//! * Every data frame carries a sequence number and is acknowledged by the receiver
//!   * acknowledgements are per frame, not cumulative, and there is no resequencing: frames are
//!     processed in arrival order
//!   * unacknowledged frames are resent with exponential backoff, giving up after a configured
//!     number of attempts (see [config::RetransmitConfig])
//! * Peers identify themselves by sending their public key in a registration frame. The server
//!   binds the key to the connection and registers it with a [registry::ConnectionRegistry],
//!   allowing lookup by identity rather than by address
//! * Liveness is checked by PING / PONG keepalive frames, independently of data traffic
//! * A server closes a peer's inbound queue if it does not hear from it within a configured
//!   read timeout. The connection itself stays open and registered, it is up to its owner to
//!   close it
//!
//! ## Wire format
//!
//! All numbers are big-endian. The first byte is always the frame type:
//!
//! ```ascii
//! 0x01 NORMAL, 0x02 FEC, 0x04 REGISTER:
//!  0: type (u8)
//!  1: sequence number (u32)
//!  5: payload length (u32)
//!  9: payload
//!
//! 0x80 ACK:
//!  0: type (u8)
//!  1: acknowledged sequence number (u32)
//!
//! 0x03 SYN, 0x81 PING, 0x82 PONG, 0x83 FIN:
//!  0: type (u8)
//! ```
//!
//! A datagram (and therefore a frame including its header) is at most
//!  [config::ConnConfig::max_datagram_size] bytes, 1024 by default.
//!
//! FEC, SYN and FIN are decoded but not acted upon, they are reserved for forward error
//!  correction and explicit connection handshakes.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod peer_key;
pub mod registry;
pub mod send_socket;
pub mod server;

#[cfg(test)]
mod test_util;
