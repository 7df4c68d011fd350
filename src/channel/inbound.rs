//! The receiving half of a channel.
//!
//! Units (segments and fragments) arrive in any order. Each one is classified
//! against `next`, the sequence number expected next:
//!
//! - `== next`: delivered at once and the delivery sweep runs.
//! - ahead, with the current reliable sequence number (or the very next
//!   reliable one): an unreliable unit racing ahead. It is delivered and
//!   everything buffered below it is dropped.
//! - ahead, past a missing reliable unit: buffered.
//! - behind but inside the ack window: acknowledged again, never delivered.
//! - anything else is silently discarded.
use std::sync::Arc;

use crate::collections::OrdinalTree;
use crate::memory::{Memory, MemoryPool};
use crate::protocol::ack::Ack;
use crate::protocol::frame::{Fragment, Segment};
use crate::protocol::ordinal::{cross_sequence, WindowTimes};
use crate::protocol::{Ordinal, Time};

/// What a buffered unit holds.
#[derive(Debug)]
pub(crate) enum Payload {
    Data(Memory),
    /// A segment without payload, such as a ping.
    Empty,
    /// A fragment whose bytes went into the reassembly keyed by `reassembly`.
    Fragment { first: Ordinal, reassembly: Ordinal },
}

#[derive(Debug)]
pub(crate) struct InboundMessage {
    reliable_sequence: Ordinal,
    reliable: bool,
    payload: Payload,
}

/// A fragmented datagram being put back together. Keyed by the sequence
/// number of its last fragment.
#[derive(Debug)]
pub(crate) struct Reassembly {
    last: u8,
    data: Memory,
}

/// Acknowledgement waiting to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAck {
    pub next: Ordinal,
    pub count: u16,
    pub latest_remote_time: Time,
}

/// The side effects of one received unit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Receipt {
    /// Payload bytes accepted for the first time.
    pub received: usize,
    /// An acknowledgement became pending and the channel must be queued.
    pub ack: bool,
}

#[derive(Debug)]
pub(crate) struct Inbound {
    next: Ordinal,
    next_reliable: Ordinal,
    last: Ordinal,
    lowest: Ordinal,
    cross_sequence: u32,
    window_times: WindowTimes,
    ack: Option<PendingAck>,
    messages: OrdinalTree<InboundMessage>,
    reassemblies: OrdinalTree<Reassembly>,
}

impl Inbound {
    /// A channel opened by a connection request sent at `remote_time`.
    pub fn new(remote_time: Time) -> Self {
        Self {
            next: Ordinal(0),
            next_reliable: Ordinal(0),
            last: Ordinal(0),
            lowest: Ordinal(0),
            cross_sequence: 0,
            window_times: WindowTimes::new(remote_time),
            ack: None,
            messages: OrdinalTree::new(),
            reassemblies: OrdinalTree::new(),
        }
    }

    pub fn next(&self) -> Ordinal {
        self.next
    }

    pub fn next_reliable(&self) -> Ordinal {
        self.next_reliable
    }

    pub fn last(&self) -> Ordinal {
        self.last
    }

    pub fn lowest(&self) -> Ordinal {
        self.lowest
    }

    /// Units buffered out of order.
    pub fn buffered(&self) -> usize {
        self.messages.len()
    }

    pub fn pending_ack(&self) -> Option<PendingAck> {
        self.ack
    }

    /// The pending acknowledgement as a wire message.
    pub fn ack_message(&self, channel: u8) -> Option<Ack> {
        self.ack.map(|ack| {
            Ack::new(
                channel,
                ack.count,
                self.next,
                self.last,
                ack.latest_remote_time,
            )
        })
    }

    /// Called once the pending acknowledgement has been written.
    pub fn clear_ack(&mut self) {
        self.ack = None;
    }

    /// Raises every static window to `time`.
    pub fn adjust_windows(&mut self, time: Time) {
        self.window_times.adjust(time);
    }

    /// Cross sequence number and static window of `sequence`.
    fn locate(&self, sequence: Ordinal) -> (u32, usize) {
        cross_sequence(self.cross_sequence, sequence.distance(self.next) + 1)
    }

    fn advance_to(&mut self, next: Ordinal) {
        let delta = (next - self.next) as i32;
        self.cross_sequence = cross_sequence(self.cross_sequence, delta).0;
        self.next = next;
    }

    fn update_last(&mut self) {
        self.last = match self.messages.first() {
            Some((sequence, _)) => sequence - 1,
            None => self.next,
        };
    }

    fn update_lowest(&mut self) {
        let value = self.next - Ordinal::WINDOW_SIZE;
        if value > self.lowest {
            self.lowest = value;
        }
    }

    /// Updates the ack accumulator. Duplicates are counted once per packet.
    fn acknowledge(&mut self, remote_time: Time, first_in_packet: bool) -> bool {
        match self.ack.as_mut() {
            None => {
                self.ack = Some(PendingAck {
                    next: self.next,
                    count: 1,
                    latest_remote_time: remote_time,
                });
                true
            }
            Some(ack) => {
                if ack.next != self.next {
                    ack.next = self.next;
                    ack.count = 1;
                } else if first_in_packet {
                    ack.count = ack.count.saturating_add(1);
                }
                ack.latest_remote_time = ack.latest_remote_time.max(remote_time);
                false
            }
        }
    }

    fn discard_below(&mut self, sequence: Ordinal) {
        self.messages.remove_below(sequence);
        self.reassemblies.remove_below(sequence);
    }

    pub fn on_segment(
        &mut self,
        pool: &Arc<MemoryPool>,
        segment: &Segment<'_>,
        remote_time: Time,
        first_in_packet: bool,
        delivered: &mut Vec<Memory>,
    ) -> Receipt {
        let mut receipt = Receipt::default();
        let sequence = segment.sequence;
        let rsn = segment.reliable_sequence;

        if sequence == self.next {
            let (xseq, window) = self.locate(sequence);
            if !self.window_times.accepts(window, remote_time) {
                return receipt;
            }
            self.window_times.accept(window, remote_time);

            if !segment.data.is_empty() {
                delivered.push(pool.copy_of(segment.data));
            }
            receipt.received = segment.data.len();

            self.cross_sequence = xseq;
            self.next = sequence + 1;
            if segment.reliable {
                self.next_reliable = rsn;
                self.deliver(delivered);
            }
            self.update_last();
            self.update_lowest();
            receipt.ack = self.acknowledge(remote_time, first_in_packet);
        } else if sequence > self.next {
            let (xseq, window) = self.locate(sequence);
            if !self.window_times.accepts(window, remote_time) {
                return receipt;
            }
            let racing = rsn == self.next_reliable
                || (segment.reliable && rsn == self.next_reliable + 1);
            // behind the reliable sequence already delivered
            if !racing && !(rsn > self.next_reliable) {
                return receipt;
            }
            self.window_times.accept(window, remote_time);

            if racing {
                if !segment.data.is_empty() {
                    delivered.push(pool.copy_of(segment.data));
                }
                receipt.received = segment.data.len();

                self.discard_below(sequence);
                self.cross_sequence = xseq;
                self.next = sequence + 1;
                self.next_reliable = rsn;
                if segment.reliable {
                    self.deliver(delivered);
                }
                self.update_last();
                self.update_lowest();
            } else {
                let (_, inserted) = self.messages.get_or_insert_with(sequence, || InboundMessage {
                    reliable_sequence: rsn,
                    reliable: segment.reliable,
                    payload: match segment.data.is_empty() {
                        true => Payload::Empty,
                        false => Payload::Data(pool.copy_of(segment.data)),
                    },
                });
                if inserted {
                    receipt.received = segment.data.len();
                }
                self.update_last();
            }
            receipt.ack = self.acknowledge(remote_time, first_in_packet);
        } else if sequence >= self.lowest {
            let (_, window) = self.locate(sequence);
            if self.window_times.accepts(window, remote_time) {
                receipt.ack = self.acknowledge(remote_time, first_in_packet);
            }
        }
        receipt
    }

    /// Handles a fragment already checked against `max_fragment_size`.
    pub fn on_fragment(
        &mut self,
        pool: &Arc<MemoryPool>,
        fragment: &Fragment<'_>,
        max_fragment_size: u16,
        remote_time: Time,
        first_in_packet: bool,
        delivered: &mut Vec<Memory>,
    ) -> Receipt {
        let mut receipt = Receipt::default();
        let sequence = fragment.sequence;
        let rsn = fragment.reliable_sequence;
        let last = fragment.last_index(max_fragment_size);
        let key = sequence + (last - fragment.index) as u16;
        let first = sequence - fragment.index as u16;
        let offset = fragment.index as usize * max_fragment_size as usize;
        let length = fragment.datagram_length as usize;

        if sequence == self.next {
            let (xseq, window) = self.locate(sequence);
            if !self.window_times.accepts(window, remote_time) {
                return receipt;
            }
            let reassembly = match reassembly(&mut self.reassemblies, pool, key, last, length) {
                Some(reassembly) => reassembly,
                None => return receipt,
            };
            reassembly.data.copy_from(offset, fragment.data);
            self.window_times.accept(window, remote_time);
            receipt.received = fragment.data.len();

            if fragment.index == last {
                if let Some(complete) = self.reassemblies.remove(key) {
                    delivered.push(complete.data);
                }
                self.discard_below(key + 1);
                self.advance_to(key + 1);
                if fragment.reliable {
                    self.next_reliable = rsn;
                    self.deliver(delivered);
                }
            } else {
                self.cross_sequence = xseq;
                self.next = sequence + 1;
                self.next_reliable = rsn;
                self.deliver(delivered);
            }
            self.update_last();
            self.update_lowest();
            receipt.ack = self.acknowledge(remote_time, first_in_packet);
        } else if sequence > self.next {
            let (_, window) = self.locate(sequence);
            if !self.window_times.accepts(window, remote_time) {
                return receipt;
            }
            let racing = rsn == self.next_reliable
                || (fragment.reliable && rsn == self.next_reliable + 1);
            if !racing && !(rsn > self.next_reliable) {
                return receipt;
            }
            let reassembly = match reassembly(&mut self.reassemblies, pool, key, last, length) {
                Some(reassembly) => reassembly,
                None => return receipt,
            };
            let data = &mut reassembly.data;
            self.window_times.accept(window, remote_time);

            let (_, inserted) = self.messages.get_or_insert_with(sequence, || {
                data.copy_from(offset, fragment.data);
                InboundMessage {
                    reliable_sequence: rsn,
                    reliable: fragment.reliable,
                    payload: Payload::Fragment {
                        first,
                        reassembly: key,
                    },
                }
            });
            if inserted {
                receipt.received = fragment.data.len();
                if racing {
                    // A newer datagram supersedes older unreliable ones
                    // whether or not they were complete.
                    if self.next < first {
                        self.discard_below(first);
                        self.advance_to(first);
                        self.next_reliable = rsn;
                    }
                    self.deliver(delivered);
                    self.update_last();
                    self.update_lowest();
                } else {
                    self.update_last();
                }
            }
            receipt.ack = self.acknowledge(remote_time, first_in_packet);
        } else if sequence >= self.lowest {
            let (_, window) = self.locate(sequence);
            if self.window_times.accepts(window, remote_time) {
                receipt.ack = self.acknowledge(remote_time, first_in_packet);
            }
        }
        receipt
    }

    /// Delivers buffered units that are no longer blocked, in order.
    ///
    /// Traversal stops at the first unit still waiting for a missing
    /// reliable one. Everything below the new `next` is dropped afterwards.
    fn deliver(&mut self, delivered: &mut Vec<Memory>) {
        let mut next = self.next;
        let mut next_reliable = self.next_reliable;
        let mut ready = Vec::new();

        for (sequence, message) in self.messages.iter() {
            if sequence == next {
                ready.push(sequence);
                next = sequence + 1;
                next_reliable = message.reliable_sequence;
            } else if message.reliable_sequence == next_reliable {
                match message.payload {
                    // an incomplete datagram is only skipped, never delivered
                    Payload::Fragment { first, .. } => {
                        if next < first {
                            next = first;
                        }
                        if sequence == next {
                            ready.push(sequence);
                            next = sequence + 1;
                        }
                    }
                    _ => {
                        ready.push(sequence);
                        next = sequence + 1;
                    }
                }
            } else if message.reliable && message.reliable_sequence == next_reliable + 1 {
                ready.push(sequence);
                next = sequence + 1;
                next_reliable = message.reliable_sequence;
            } else {
                break;
            }
        }

        for sequence in ready {
            let message = match self.messages.remove(sequence) {
                Some(message) => message,
                None => continue,
            };
            match message.payload {
                Payload::Data(data) => delivered.push(data),
                Payload::Empty => {}
                Payload::Fragment { reassembly, .. } => {
                    if reassembly == sequence {
                        if let Some(complete) = self.reassemblies.remove(reassembly) {
                            delivered.push(complete.data);
                        }
                    }
                }
            }
        }

        self.discard_below(next);
        self.advance_to(next);
        self.next_reliable = next_reliable;
    }
}

/// Finds or creates the reassembly under `key`. A fragment that disagrees
/// with an existing reassembly on its shape is rejected.
fn reassembly<'a>(
    reassemblies: &'a mut OrdinalTree<Reassembly>,
    pool: &Arc<MemoryPool>,
    key: Ordinal,
    last: u8,
    length: usize,
) -> Option<&'a mut Reassembly> {
    let (reassembly, inserted) = reassemblies.get_or_insert_with(key, || Reassembly {
        last,
        data: pool.allocate(length),
    });
    if !inserted && (reassembly.last != last || reassembly.data.len() != length) {
        return None;
    }
    Some(reassembly)
}
