use std::time::Duration;
use anyhow::bail;
use crate::frame::DATA_HEADER_LEN;

/// Largest UDP payload over IPV4
const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Clone, Debug)]
pub struct ConnConfig {
    /// This is the maximum size of a datagram that is sent or received. Incoming datagrams are
    ///  read into a buffer of this size, and outgoing frames that do not fit are rejected with
    ///  [crate::error::ConnError::PayloadTooLarge].
    ///
    /// Fragmentation of application data is not done here, so payloads must fit into a single
    ///  datagram after subtracting the 9 byte data frame header.
    pub max_datagram_size: usize,

    /// The write loop sends a PING whenever this interval elapses
    pub keepalive_interval: Duration,

    /// If set, a server socket that receives no datagram for this long closes the inbound queue
    ///  of the peer that sent the most recent datagram. The connection stays registered.
    pub read_timeout: Option<Duration>,

    /// Capacity of the queue delivering received payloads to the connection's owner. The
    ///  default of 1 is as close to an unbuffered hand-off as a bounded channel gets: a slow
    ///  consumer stalls the read path.
    pub inbound_queue_size: usize,
    pub outbound_queue_size: usize,

    /// Number of recently received data frame sequence numbers a connection remembers. A resent
    ///  frame whose sequence number is still in this window is acknowledged again but not
    ///  delivered a second time.
    pub duplicate_window: usize,

    pub registration_policy: RegistrationPolicy,

    /// `None` means that pending sends are tracked but never resent, i.e. at-most-once delivery
    pub retransmit: Option<RetransmitConfig>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            max_datagram_size: 1024,
            keepalive_interval: Duration::from_secs(60),
            read_timeout: None,
            inbound_queue_size: 1,
            outbound_queue_size: 1,
            duplicate_window: 1024,
            registration_policy: RegistrationPolicy::FirstBindWins,
            retransmit: Some(RetransmitConfig::default()),
        }
    }
}

impl ConnConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= DATA_HEADER_LEN {
            bail!("datagram size {} leaves no room for a payload", self.max_datagram_size);
        }
        if self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("datagram size {} exceeds the maximum UDP payload of {}", self.max_datagram_size, MAX_UDP_PAYLOAD);
        }
        if self.keepalive_interval.is_zero() {
            bail!("keepalive interval must not be zero");
        }
        if self.read_timeout.is_some_and(|t| t.is_zero()) {
            bail!("read timeout must not be zero");
        }
        if self.inbound_queue_size == 0 || self.outbound_queue_size == 0 {
            bail!("queue sizes must be at least 1");
        }
        if self.duplicate_window == 0 {
            bail!("duplicate window must hold at least one sequence number");
        }
        if let Some(retransmit) = &self.retransmit {
            retransmit.validate()?;
        }
        Ok(())
    }

    /// the largest payload that fits into a single data frame
    pub fn max_payload_len(&self) -> usize {
        self.max_datagram_size.saturating_sub(DATA_HEADER_LEN)
    }
}

/// What happens when a peer sends a registration frame for a connection that already has a
///  bound public key
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistrationPolicy {
    /// The first key is immutable. Later registrations with a different key are acknowledged
    ///  (they were received after all) but otherwise ignored.
    FirstBindWins,
    /// A registration with a different key replaces the binding, unregistering the previous key
    LastBindWins,
}

#[derive(Clone, Debug)]
pub struct RetransmitConfig {
    /// time after the initial send before the first resend
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
    /// The timeout is multiplied by this factor (in eighths, i.e. 16 doubles it) after each resend
    pub backoff_factor_eighths: u32,
    /// An entry is dropped from the pending sends after this many resends
    pub max_attempts: u32,
    /// The write loop checks for overdue pending sends at this interval
    pub check_interval: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            initial_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30),
            backoff_factor_eighths: 16,
            max_attempts: 8,
            check_interval: Duration::from_millis(250),
        }
    }
}

impl RetransmitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_timeout.is_zero() {
            bail!("initial retransmit timeout must not be zero");
        }
        if self.initial_timeout > self.max_timeout {
            bail!("initial retransmit timeout {:?} exceeds the maximum of {:?}", self.initial_timeout, self.max_timeout);
        }
        if self.backoff_factor_eighths < 8 {
            bail!("backoff factor must be at least 8 eighths, was {}", self.backoff_factor_eighths);
        }
        if self.max_attempts == 0 {
            bail!("max retransmit attempts must be at least 1");
        }
        if self.check_interval.is_zero() {
            bail!("retransmit check interval must not be zero");
        }
        Ok(())
    }

    /// the timeout following `timeout` after one more resend
    pub fn next_timeout(&self, timeout: Duration) -> Duration {
        let scaled = timeout * self.backoff_factor_eighths / 8;
        scaled.min(self.max_timeout)
    }
}
