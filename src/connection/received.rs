use std::collections::VecDeque;
use rustc_hash::FxHashSet;

/// Sequence numbers of the most recently received data frames, used to recognize frames that
///  the peer resent because our ACK got lost. The oldest entry is evicted when the window is full.
pub struct ReceivedSequences {
    capacity: usize,
    order: VecDeque<u32>,
    known: FxHashSet<u32>,
}

impl ReceivedSequences {
    pub fn new(capacity: usize) -> ReceivedSequences {
        ReceivedSequences {
            capacity,
            order: VecDeque::with_capacity(capacity),
            known: Default::default(),
        }
    }

    /// Records a sequence number, returning `false` if it is in the window already
    pub fn insert(&mut self, sequence: u32) -> bool {
        if !self.known.insert(sequence) {
            return false;
        }

        self.order.push_back(sequence);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.known.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}
