//! The sending half of a channel.
//!
//! Messages stay in `messages` from the moment they are flushed out of
//! staging until they are acknowledged, expire or are given up on.
//! `transmit` points at the first message never transmitted and `retransmit`
//! at the next one to retransmit, if the channel is retransmitting.
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use crate::collections::{Handle, List};
use crate::memory::{Memory, MemoryPool};
use crate::protocol::{message_flags, Delivery, Ordinal, Time};

/// Offset of SEQ in an encoded data message.
pub(crate) const SEQUENCE_OFFSET: usize = 2;
/// Offset of RSN in an encoded data message.
pub(crate) const RELIABLE_SEQUENCE_OFFSET: usize = 4;

#[derive(Debug)]
pub(crate) struct OutboundMessage {
    pub delivery: Delivery,
    pub sequence: Ordinal,
    /// Until the first transmission this is the expiration time.
    pub first_send_time: Time,
    pub latest_send_time: Time,
    /// Payload bytes. A ping counts as one.
    pub payload: u16,
    /// The message as it goes on the wire. Dropped after the first
    /// transmission of an unreliable message.
    pub encoded: Option<Memory>,
}

impl OutboundMessage {
    fn new(delivery: Delivery, expiration: Time, payload: u16, encoded: Vec<u8>, pool: &Arc<MemoryPool>) -> Self {
        Self {
            delivery,
            sequence: Ordinal(0),
            first_send_time: expiration,
            latest_send_time: expiration,
            payload,
            encoded: Some(pool.copy_of(&encoded)),
        }
    }

    /// `FLAGS CH SEQ RSN LEN PAYLOAD` with SEQ and RSN left blank. They are
    /// only known once the worker transmits the message.
    pub fn segment(
        pool: &Arc<MemoryPool>,
        channel: u8,
        delivery: Delivery,
        expiration: Time,
        data: &[u8],
    ) -> Self {
        let flags = match delivery.is_reliable() {
            true => message_flags::RELIABLE_SEGMENT,
            false => message_flags::UNRELIABLE_SEGMENT,
        };
        let mut encoded = Vec::with_capacity(8 + data.len());
        encoded.push(flags);
        encoded.push(channel);
        encoded.extend_from_slice(&[0, 0, 0, 0]);
        // writing into a Vec never fails
        let _ = encoded.write_u16::<BigEndian>(data.len() as u16);
        encoded.extend_from_slice(data);
        Self::new(delivery, expiration, data.len() as u16, encoded, pool)
    }

    /// `FLAGS CH SEQ RSN SEGLEN INDEX FRAGLEN PAYLOAD`
    pub fn fragment(
        pool: &Arc<MemoryPool>,
        channel: u8,
        delivery: Delivery,
        expiration: Time,
        datagram_length: u16,
        index: u8,
        data: &[u8],
    ) -> Self {
        let flags = match delivery.is_reliable() {
            true => message_flags::RELIABLE_FRAGMENT,
            false => message_flags::UNRELIABLE_FRAGMENT,
        };
        let mut encoded = Vec::with_capacity(11 + data.len());
        encoded.push(flags);
        encoded.push(channel);
        encoded.extend_from_slice(&[0, 0, 0, 0]);
        let _ = encoded.write_u16::<BigEndian>(datagram_length);
        encoded.push(index);
        let _ = encoded.write_u16::<BigEndian>(data.len() as u16);
        encoded.extend_from_slice(data);
        Self::new(delivery, expiration, data.len() as u16, encoded, pool)
    }

    /// An empty reliable segment on channel 0. Occupies one virtual byte so
    /// it is accounted like any other reliable message.
    pub fn ping(pool: &Arc<MemoryPool>, expiration: Time) -> Self {
        let mut message = Self::segment(pool, 0, Delivery::Reliable, expiration, &[]);
        message.payload = 1;
        message
    }

    /// Splits a datagram into messages of at most `max_segment_size` bytes,
    /// or fragments of `max_fragment_size` bytes when it does not fit.
    pub fn split(
        pool: &Arc<MemoryPool>,
        channel: u8,
        delivery: Delivery,
        expiration: Time,
        data: &[u8],
        max_segment_size: u16,
        max_fragment_size: u16,
    ) -> Vec<Self> {
        if data.len() <= max_segment_size as usize {
            return vec![Self::segment(pool, channel, delivery, expiration, data)];
        }
        data.chunks(max_fragment_size.max(1) as usize)
            .enumerate()
            .map(|(index, chunk)| {
                Self::fragment(
                    pool,
                    channel,
                    delivery,
                    expiration,
                    data.len() as u16,
                    index as u8,
                    chunk,
                )
            })
            .collect()
    }

    /// Encoded length, zero once the bytes were dropped.
    pub fn encoded_len(&self) -> usize {
        self.encoded.as_ref().map_or(0, Memory::len)
    }
}

/// Sender side view of the remote acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckState {
    pub next: Ordinal,
    pub last: Ordinal,
    /// Acks received for `next`. Starts at 1 as if `next == 0` had been
    /// acknowledged already, so the very first message can also be fast
    /// retransmitted.
    pub count: u16,
}

#[derive(Debug)]
pub(crate) struct Outbound {
    pub messages: List<OutboundMessage>,
    pub transmit: Option<Handle>,
    pub retransmit: Option<Handle>,
    pub next_sequence: Ordinal,
    pub next_reliable: Ordinal,
    pub latest_ack_remote_time: Time,
    pub ack: AckState,
    /// Set when a fast retransmission fired for the current `ack.next`.
    pub fast_retransmitted: bool,
}

impl Default for Outbound {
    fn default() -> Self {
        Self {
            messages: List::new(),
            transmit: None,
            retransmit: None,
            next_sequence: Ordinal(0),
            next_reliable: Ordinal(0),
            latest_ack_remote_time: Time(0),
            ack: AckState {
                next: Ordinal(0),
                last: Ordinal(0),
                count: 1,
            },
            fast_retransmitted: false,
        }
    }
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends messages flushed out of staging. The first of them becomes
    /// the transmit cursor if nothing was waiting.
    pub fn append(&mut self, messages: Vec<OutboundMessage>) {
        let first = self.messages.append(messages);
        if self.transmit.is_none() {
            self.transmit = first;
        }
    }

    /// Whether there are messages sent but not acknowledged yet.
    pub fn in_flight(&self) -> bool {
        self.messages.first() != self.transmit
    }

    /// Whether the retransmit cursor points at a message that is gone.
    pub fn retransmit_is_stale(&self) -> bool {
        match self.retransmit {
            Some(handle) => !self.messages.contains(handle),
            None => false,
        }
    }

    /// Whether the channel has nothing left to (re)transmit.
    pub fn is_idle(&self) -> bool {
        self.transmit.is_none() && self.retransmit.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Message, Messages};

    #[test]
    fn segment_encoding_leaves_room_for_sequence_numbers() {
        let pool = MemoryPool::new();
        let message = OutboundMessage::segment(&pool, 3, Delivery::Reliable, Time(10), b"hi");
        let encoded = message.encoded.as_ref().unwrap().to_vec();
        assert_eq!(encoded, vec![0x60, 3, 0, 0, 0, 0, 0, 2, b'h', b'i']);
        assert_eq!(message.payload, 2);
        assert_eq!(message.first_send_time, Time(10));

        let message = OutboundMessage::segment(&pool, 0, Delivery::Semireliable, Time(0), b"x");
        assert_eq!(message.encoded.as_ref().unwrap().to_vec()[0], 0x20);
    }

    #[test]
    fn split_produces_well_formed_fragments() {
        let pool = MemoryPool::new();
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let messages =
            OutboundMessage::split(&pool, 1, Delivery::Reliable, Time(0), &data, 259, 256);
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages.iter().map(|m| m.payload).collect::<Vec<_>>(),
            vec![256, 256, 88]
        );
        for (index, message) in messages.iter().enumerate() {
            let encoded = message.encoded.as_ref().unwrap().to_vec();
            match Messages::new(&encoded).next() {
                Some(Ok(Message::Fragment(fragment))) => {
                    assert_eq!(fragment.index as usize, index);
                    assert_eq!(fragment.datagram_length, 600);
                    assert!(fragment.is_well_formed(256));
                }
                other => panic!("expected a fragment, got {:?}", other),
            }
        }
    }

    #[test]
    fn ping_takes_one_virtual_byte() {
        let pool = MemoryPool::new();
        let ping = OutboundMessage::ping(&pool, Time(0));
        assert_eq!(ping.payload, 1);
        assert_eq!(ping.encoded_len(), 8);
    }

    #[test]
    fn append_sets_the_transmit_cursor_once() {
        let pool = MemoryPool::new();
        let mut outbound = Outbound::new();
        assert!(!outbound.in_flight());
        outbound.append(vec![OutboundMessage::segment(&pool, 0, Delivery::Reliable, Time(0), b"a")]);
        let first = outbound.transmit;
        assert_eq!(first, outbound.messages.first());
        outbound.append(vec![OutboundMessage::segment(&pool, 0, Delivery::Reliable, Time(0), b"b")]);
        assert_eq!(outbound.transmit, first);
        assert!(!outbound.in_flight());
        // pretend the first one went out
        outbound.transmit = first.and_then(|h| outbound.messages.next(h));
        assert!(outbound.in_flight());
        assert_eq!(outbound.ack.count, 1);
    }
}
