use std::collections::BTreeMap;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use crate::config::RetransmitConfig;

struct PendingSend {
    packet: Bytes,
    /// `None` if retransmission is switched off
    resend_at: Option<Instant>,
    timeout: Duration,
    num_resends: u32,
}

/// Sent data / registration frames waiting for their acknowledgement, keyed by sequence number
#[derive(Default)]
pub struct PendingSends {
    entries: BTreeMap<u32, PendingSend>,
}

#[derive(Debug, Default)]
pub struct Overdue {
    pub resend: Vec<(u32, Bytes)>,
    pub given_up: Vec<u32>,
}

impl PendingSends {
    pub fn insert(&mut self, sequence: u32, packet: Bytes, now: Instant, retransmit: Option<&RetransmitConfig>) {
        let (resend_at, timeout) = match retransmit {
            Some(config) => (Some(now + config.initial_timeout), config.initial_timeout),
            None => (None, Duration::ZERO),
        };

        self.entries.insert(sequence, PendingSend {
            packet,
            resend_at,
            timeout,
            num_resends: 0,
        });
    }

    pub fn remove(&mut self, sequence: u32) -> bool {
        self.entries.remove(&sequence).is_some()
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Collects the packets due for a resend at `now` and backs off their timeouts. Entries
    ///  that used up their resends are removed and reported as given up.
    pub fn take_overdue(&mut self, now: Instant, config: &RetransmitConfig) -> Overdue {
        let mut result = Overdue::default();

        for (&sequence, entry) in self.entries.iter_mut() {
            let Some(resend_at) = entry.resend_at else {
                continue;
            };
            if resend_at > now {
                continue;
            }

            if entry.num_resends >= config.max_attempts {
                result.given_up.push(sequence);
                continue;
            }

            entry.num_resends += 1;
            entry.timeout = config.next_timeout(entry.timeout);
            entry.resend_at = Some(now + entry.timeout);
            result.resend.push((sequence, entry.packet.clone()));
        }

        for sequence in &result.given_up {
            self.entries.remove(sequence);
        }
        result
    }
}
