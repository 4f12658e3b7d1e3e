//! Ordered transport: per-direction sequencing and reassembly.
//!
//! The bus may reorder and duplicate messages but never drops them. Each
//! channel stamps outgoing messages with a [`Sequencer`] and restores order on
//! the receive side with a [`Reassembler`]. Sequence ids are 16-bit and wrap,
//! so comparisons use serial-number arithmetic ([`is_later`]).

use crate::error::{WireError, WireResult};
use crate::message::{ChannelId, ChannelMessage};
use std::collections::VecDeque;

/// Whether sequence id `a` comes after `b`, modulo 2^16.
pub fn is_later(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Send-side sequence counter for one channel direction.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: u16,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence id to `msg`. Low-level kinds pass through
    /// untouched and do not consume an id.
    pub fn stamp(&mut self, mut msg: ChannelMessage) -> ChannelMessage {
        if msg.is_low_level() {
            msg.sequence_id = 0;
            return msg;
        }
        msg.sequence_id = self.next;
        self.next = self.next.wrapping_add(1);
        msg
    }

    /// The id the next sequenced message will carry.
    pub fn peek(&self) -> u16 {
        self.next
    }
}

/// Receive-side reorder buffer for one channel direction.
#[derive(Debug)]
pub struct Reassembler {
    channel_id: ChannelId,
    expected: u16,
    /// Early arrivals, sorted by distance from `expected`.
    buffer: VecDeque<ChannelMessage>,
}

impl Reassembler {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            expected: 0,
            buffer: VecDeque::new(),
        }
    }

    /// Accept one arrival and return every message that became deliverable,
    /// in order. An early arrival returns an empty batch.
    pub fn push(&mut self, msg: ChannelMessage) -> WireResult<Vec<ChannelMessage>> {
        if msg.is_low_level() {
            return Ok(vec![msg]);
        }
        if msg.channel_id != self.channel_id {
            return Err(WireError::ForeignChannel {
                owner: self.channel_id,
                got: msg.channel_id,
            });
        }

        let seq = msg.sequence_id;
        if seq == self.expected {
            let mut ready = vec![msg];
            self.expected = self.expected.wrapping_add(1);
            while self
                .buffer
                .front()
                .is_some_and(|m| m.sequence_id == self.expected)
            {
                if let Some(next) = self.buffer.pop_front() {
                    ready.push(next);
                }
                self.expected = self.expected.wrapping_add(1);
            }
            return Ok(ready);
        }

        if !is_later(seq, self.expected) {
            return Err(WireError::StaleSequence {
                seq,
                expected: self.expected,
            });
        }

        let expected = self.expected;
        let distance = seq.wrapping_sub(expected);
        match self
            .buffer
            .binary_search_by_key(&distance, |m| m.sequence_id.wrapping_sub(expected))
        {
            Ok(_) => Err(WireError::DuplicateSequence { seq, expected }),
            Err(pos) => {
                self.buffer.insert(pos, msg);
                Ok(Vec::new())
            }
        }
    }

    /// Next sequence id this reassembler will deliver.
    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Number of early arrivals waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageKind, Payload};
    use uuid::Uuid;

    fn data(id: ChannelId, seq: u16) -> ChannelMessage {
        ChannelMessage {
            kind: MessageKind::DataFromClient,
            sequence_id: seq,
            channel_id: id,
            body: MessageBody::Data(Payload::Text(seq.to_string())),
        }
    }

    fn seqs(batch: &[ChannelMessage]) -> Vec<u16> {
        batch.iter().map(|m| m.sequence_id).collect()
    }

    #[test]
    fn test_is_later_wraps() {
        assert!(is_later(1, 0));
        assert!(!is_later(0, 1));
        assert!(!is_later(5, 5));
        assert!(is_later(0, 65535));
        assert!(is_later(3, 65530));
        assert!(!is_later(65530, 3));
    }

    #[test]
    fn test_sequencer_counts_and_skips_low_level() {
        let id = Uuid::new_v4();
        let mut seq = Sequencer::new();
        assert_eq!(seq.stamp(data(id, 99)).sequence_id, 0);
        assert_eq!(seq.stamp(ChannelMessage::ping(id)).sequence_id, 0);
        assert_eq!(seq.stamp(data(id, 99)).sequence_id, 1);
        assert_eq!(seq.peek(), 2);
    }

    #[test]
    fn test_sequencer_wraps() {
        let id = Uuid::new_v4();
        let mut seq = Sequencer { next: 65535 };
        assert_eq!(seq.stamp(data(id, 0)).sequence_id, 65535);
        assert_eq!(seq.stamp(data(id, 0)).sequence_id, 0);
    }

    #[test]
    fn test_in_order_delivery() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        for i in 0..5 {
            assert_eq!(seqs(&r.push(data(id, i)).unwrap()), vec![i]);
        }
        assert_eq!(r.expected(), 5);
    }

    #[test]
    fn test_gap_stall() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        assert_eq!(seqs(&r.push(data(id, 0)).unwrap()), vec![0]);
        assert_eq!(seqs(&r.push(data(id, 1)).unwrap()), vec![1]);
        assert!(r.push(data(id, 3)).unwrap().is_empty());
        assert!(r.push(data(id, 4)).unwrap().is_empty());
        assert_eq!(r.buffered(), 2);
        assert_eq!(seqs(&r.push(data(id, 2)).unwrap()), vec![2, 3, 4]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_duplicate_while_buffered() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        r.push(data(id, 2)).unwrap();
        assert_eq!(
            r.push(data(id, 2)),
            Err(WireError::DuplicateSequence { seq: 2, expected: 0 })
        );
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn test_stale_after_delivery() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        r.push(data(id, 0)).unwrap();
        r.push(data(id, 1)).unwrap();
        assert_eq!(
            r.push(data(id, 0)),
            Err(WireError::StaleSequence { seq: 0, expected: 2 })
        );
    }

    #[test]
    fn test_foreign_channel_rejected() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        assert!(matches!(
            r.push(data(other, 0)),
            Err(WireError::ForeignChannel { .. })
        ));
        assert_eq!(r.expected(), 0);
    }

    #[test]
    fn test_low_level_bypasses_buffer() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        r.push(data(id, 1)).unwrap();
        let batch = r.push(ChannelMessage::medium_break()).unwrap();
        assert_eq!(batch, vec![ChannelMessage::medium_break()]);
        assert_eq!(r.expected(), 0);
        assert_eq!(r.buffered(), 1);
    }

    #[test]
    fn test_reorder_across_wrap() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        r.expected = 65534;
        assert!(r.push(data(id, 1)).unwrap().is_empty());
        assert!(r.push(data(id, 65535)).unwrap().is_empty());
        assert!(r.push(data(id, 0)).unwrap().is_empty());
        assert_eq!(
            seqs(&r.push(data(id, 65534)).unwrap()),
            vec![65534, 65535, 0, 1]
        );
        assert_eq!(r.expected(), 2);
    }

    #[test]
    fn test_every_permutation_delivers_in_order() {
        fn permutations(items: Vec<u16>) -> Vec<Vec<u16>> {
            if items.len() <= 1 {
                return vec![items];
            }
            let mut out = Vec::new();
            for i in 0..items.len() {
                let mut rest = items.clone();
                let head = rest.remove(i);
                for mut tail in permutations(rest) {
                    tail.insert(0, head);
                    out.push(tail);
                }
            }
            out
        }

        let id = Uuid::new_v4();
        for order in permutations((0..6).collect()) {
            let mut r = Reassembler::new(id);
            let mut delivered = Vec::new();
            for seq in &order {
                delivered.extend(seqs(&r.push(data(id, *seq)).unwrap()));
            }
            assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5], "order {order:?}");
            assert_eq!(r.buffered(), 0);
        }
    }

    #[test]
    fn test_duplicates_interleaved_deliver_once() {
        let id = Uuid::new_v4();
        let mut r = Reassembler::new(id);
        let mut delivered = Vec::new();
        for seq in [2u16, 0, 2, 1, 0, 3, 1, 3] {
            if let Ok(batch) = r.push(data(id, seq)) {
                delivered.extend(seqs(&batch));
            }
        }
        assert_eq!(delivered, vec![0, 1, 2, 3]);
    }
}
