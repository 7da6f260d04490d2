use std::collections::VecDeque;

use crate::message::Message;
use crate::protocol::{sequence_greater_than, sequence_lte, SequencedMessage, WireMessage};

#[derive(Debug)]
struct InFlight {
    sequence: u32,
    message: Message,
    last_send: Option<f64>,
}

/// Sending half of the reliable-ordered channel. Holds every message until
/// it is covered by a cumulative ack; the in-flight window doubles as the
/// channel's send-capacity signal.
#[derive(Debug)]
pub struct ReliableSender {
    next_sequence: u32,
    window: usize,
    resend_interval: f64,
    in_flight: VecDeque<InFlight>,
}

impl ReliableSender {
    pub fn new(window: usize, resend_interval: f64) -> Self {
        Self {
            next_sequence: 1,
            window,
            resend_interval,
            in_flight: VecDeque::with_capacity(window),
        }
    }

    pub fn can_send(&self) -> bool {
        self.in_flight.len() < self.window
    }

    pub fn send(&mut self, message: Message) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.in_flight.push_back(InFlight {
            sequence,
            message,
            last_send: None,
        });
        sequence
    }

    /// Returns everything due for (re)transmission at `now`, stamping the
    /// send time. Unsent messages are always due.
    pub fn collect_due(&mut self, now: f64) -> Vec<SequencedMessage> {
        let mut due = Vec::new();
        for entry in &mut self.in_flight {
            let ready = match entry.last_send {
                None => true,
                Some(t) => now - t >= self.resend_interval,
            };
            if ready {
                entry.last_send = Some(now);
                due.push(SequencedMessage {
                    sequence: entry.sequence,
                    message: WireMessage {
                        kind: entry.message.kind.0,
                        payload: entry.message.payload.clone(),
                    },
                });
            }
        }
        due
    }

    /// Drops everything covered by the cumulative ack and hands the owned
    /// messages back so the caller can return them to the pool.
    pub fn ack(&mut self, cumulative: u32) -> Vec<Message> {
        let mut released = Vec::new();
        while let Some(front) = self.in_flight.front() {
            if sequence_lte(front.sequence, cumulative) {
                if let Some(entry) = self.in_flight.pop_front() {
                    released.push(entry.message);
                }
            } else {
                break;
            }
        }
        released
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.in_flight.drain(..).map(|e| e.message).collect()
    }
}

/// Receiving half of the reliable-ordered channel. Releases messages
/// strictly in sequence, buffering gaps and discarding duplicates.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    buffered: VecDeque<SequencedMessage>,
    max_buffered: usize,
}

impl ReliableReceiver {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            next_expected: 1,
            buffered: VecDeque::new(),
            max_buffered,
        }
    }

    /// Ingests one wire batch and returns whatever is now deliverable in
    /// order. Out-of-window or duplicate sequences are dropped; the sender
    /// retransmits anything that mattered.
    pub fn ingest(&mut self, batch: Vec<SequencedMessage>) -> Vec<WireMessage> {
        let mut delivered = Vec::new();

        for incoming in batch {
            if sequence_greater_than(self.next_expected, incoming.sequence) {
                continue;
            }
            if incoming.sequence == self.next_expected {
                self.next_expected = self.next_expected.wrapping_add(1);
                delivered.push(incoming.message);
                self.drain_consecutive(&mut delivered);
            } else {
                self.buffer_future(incoming);
            }
        }

        delivered
    }

    /// Highest sequence received without gaps; 0 before anything arrived.
    pub fn cumulative_ack(&self) -> u32 {
        self.next_expected.wrapping_sub(1)
    }

    fn drain_consecutive(&mut self, delivered: &mut Vec<WireMessage>) {
        while let Some(front) = self.buffered.front() {
            if front.sequence != self.next_expected {
                break;
            }
            if let Some(entry) = self.buffered.pop_front() {
                self.next_expected = self.next_expected.wrapping_add(1);
                delivered.push(entry.message);
            }
        }
    }

    fn buffer_future(&mut self, incoming: SequencedMessage) {
        if self.buffered.iter().any(|b| b.sequence == incoming.sequence) {
            return;
        }
        if self.buffered.len() >= self.max_buffered {
            return;
        }
        let pos = self
            .buffered
            .iter()
            .position(|b| sequence_greater_than(b.sequence, incoming.sequence))
            .unwrap_or(self.buffered.len());
        self.buffered.insert(pos, incoming);
    }
}

/// Unreliable-unordered lane: a bounded staging area flushed every pump.
/// Staged messages are sent once and forgotten.
#[derive(Debug)]
pub struct UnreliableSender {
    staged: Vec<Message>,
    capacity: usize,
}

impl UnreliableSender {
    pub fn new(capacity: usize) -> Self {
        Self {
            staged: Vec::new(),
            capacity,
        }
    }

    pub fn can_send(&self) -> bool {
        self.staged.len() < self.capacity
    }

    pub fn stage(&mut self, message: Message) {
        self.staged.push(message);
    }

    pub fn take(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelKind, MessageKind};

    fn msg(kind: u16, payload: &[u8]) -> Message {
        Message {
            kind: MessageKind(kind),
            channel: ChannelKind::ReliableOrdered,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn window_limits_sends() {
        let mut sender = ReliableSender::new(2, 0.1);
        assert!(sender.can_send());
        sender.send(msg(1, b"a"));
        sender.send(msg(2, b"b"));
        assert!(!sender.can_send());

        let released = sender.ack(1);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].kind, MessageKind(1));
        assert!(sender.can_send());
        assert_eq!(sender.in_flight(), 1);
    }

    #[test]
    fn resend_waits_for_the_interval() {
        let mut sender = ReliableSender::new(8, 0.1);
        sender.send(msg(1, b"a"));

        let first = sender.collect_due(0.0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].sequence, 1);

        assert!(sender.collect_due(0.05).is_empty());

        let resent = sender.collect_due(0.11);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].sequence, 1);
    }

    #[test]
    fn cumulative_ack_releases_prefix() {
        let mut sender = ReliableSender::new(8, 0.1);
        for i in 1..=3 {
            sender.send(msg(i, b"x"));
        }

        let released = sender.ack(2);
        let kinds: Vec<u16> = released.iter().map(|m| m.kind.0).collect();
        assert_eq!(kinds, vec![1, 2]);
        assert_eq!(sender.in_flight(), 1);

        assert!(sender.ack(0).is_empty());
        assert_eq!(sender.ack(3).len(), 1);
    }

    #[test]
    fn receiver_delivers_in_order() {
        let mut receiver = ReliableReceiver::new(16);
        assert_eq!(receiver.cumulative_ack(), 0);

        let seq = |n: u32| SequencedMessage {
            sequence: n,
            message: WireMessage {
                kind: n as u16,
                payload: Vec::new(),
            },
        };

        let delivered = receiver.ingest(vec![seq(1), seq(2)]);
        assert_eq!(delivered.iter().map(|m| m.kind).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(receiver.cumulative_ack(), 2);
    }

    #[test]
    fn receiver_buffers_gaps_and_drops_duplicates() {
        let mut receiver = ReliableReceiver::new(16);
        let seq = |n: u32| SequencedMessage {
            sequence: n,
            message: WireMessage {
                kind: n as u16,
                payload: Vec::new(),
            },
        };

        assert!(receiver.ingest(vec![seq(3)]).is_empty());
        assert!(receiver.ingest(vec![seq(3), seq(2)]).is_empty());
        assert_eq!(receiver.cumulative_ack(), 0);

        let delivered = receiver.ingest(vec![seq(1)]);
        assert_eq!(
            delivered.iter().map(|m| m.kind).collect::<Vec<_>>(),
            [1, 2, 3]
        );
        assert_eq!(receiver.cumulative_ack(), 3);

        assert!(receiver.ingest(vec![seq(2)]).is_empty());
        assert_eq!(receiver.cumulative_ack(), 3);
    }

    #[test]
    fn unreliable_lane_is_fire_and_forget() {
        let mut lane = UnreliableSender::new(2);
        lane.stage(msg(1, b"a"));
        assert!(lane.can_send());
        lane.stage(msg(2, b"b"));
        assert!(!lane.can_send());

        let taken = lane.take();
        assert_eq!(taken.len(), 2);
        assert!(lane.can_send());
        assert!(lane.take().is_empty());
    }
}
