//! Acknowledgements.
//!
//! A channel acknowledges cumulatively: `next` is the next sequence number it
//! expects, and `last` is the sequence number right before the first message it
//! has buffered out of order (equal to `next` when there is no gap). A count
//! greater than one turns the message into a duplicate ack.
use byteorder::{BigEndian, WriteBytesExt};

use super::message_flags;
use super::ordinal::{Ordinal, Time};

/// Ack timeout limits in milliseconds.
pub mod timeout {
    pub const MIN: u32 = 200;
    pub const MAX: u32 = 60_000;
    pub const DEFAULT: u32 = 500;

    pub fn clamp(value: u32) -> u32 {
        value.clamp(MIN, MAX)
    }
}

/// Multiplicative factor applied to the ack timeout after a timeout.
pub const BACKOFF: f32 = 1.25;
/// Consecutive ack timeouts after which the connection is dropped.
pub const FAIL_LIMIT: u32 = 10;
/// Duplicate acks that trigger a fast retransmission.
pub const FAST_RETRANSMIT_THRESHOLD: u16 = 3;

/// ATM(4)
pub const ACCEPT_ACK_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub channel: u8,
    pub count: u16,
    pub next: Ordinal,
    pub last: Ordinal,
    /// The remote time being acknowledged.
    pub acknowledged_time: Time,
}

impl Ack {
    pub fn new(channel: u8, count: u16, next: Ordinal, last: Ordinal, acknowledged_time: Time) -> Self {
        Self {
            channel,
            count,
            next,
            last,
            acknowledged_time,
        }
    }

    pub fn is_gap(&self) -> bool {
        self.next != self.last
    }

    /// The message flags this ack is encoded with.
    pub fn flags(&self) -> u8 {
        match (self.is_gap(), self.count > 1) {
            (false, false) => message_flags::DATA_ACK,
            (false, true) => message_flags::DATA_DUP_ACK,
            (true, false) => message_flags::DATA_GAP_ACK,
            (true, true) => message_flags::DATA_DUP_GAP_ACK,
        }
    }

    /// Encoded size, excluding the flags byte.
    pub fn size(&self) -> usize {
        // CH(1) NEXT(2) ATM(4) [CNT(2)] [LAST(2)]
        let mut size = 7;
        if self.count > 1 {
            size += 2;
        }
        if self.is_gap() {
            size += 2;
        }
        size
    }

    /// Appends the ack to `packet` if there is room for it under `limit`.
    pub fn try_write(&self, packet: &mut Vec<u8>, limit: usize) -> bool {
        if limit.saturating_sub(packet.len()) < self.size() + 1 {
            return false;
        }

        packet.push(self.flags());
        packet.push(self.channel);
        if self.count > 1 {
            packet.extend_from_slice(&self.count.to_be_bytes());
        }
        packet.extend_from_slice(&self.next.0.to_be_bytes());
        if self.is_gap() {
            packet.extend_from_slice(&self.last.0.to_be_bytes());
        }
        // writing into a Vec never fails
        let _ = packet.write_u32::<BigEndian>(self.acknowledged_time.0);
        true
    }
}

/// Appends an acknowledgement of an ACCEPT packet.
pub fn write_accept_ack(packet: &mut Vec<u8>, acknowledged_time: Time) {
    packet.push(message_flags::ACCEPT_ACK);
    packet.extend_from_slice(&acknowledged_time.0.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_chosen_by_gap_and_count() {
        let plain = Ack::new(1, 1, Ordinal(5), Ordinal(5), Time(9));
        assert_eq!(plain.flags(), 0xA0);
        assert_eq!(plain.size(), 7);

        let dup = Ack::new(1, 3, Ordinal(5), Ordinal(5), Time(9));
        assert_eq!(dup.flags(), 0xB0);
        assert_eq!(dup.size(), 9);

        let gap = Ack::new(1, 1, Ordinal(5), Ordinal(8), Time(9));
        assert_eq!(gap.flags(), 0xE0);
        assert_eq!(gap.size(), 9);

        let dup_gap = Ack::new(1, 2, Ordinal(5), Ordinal(8), Time(9));
        assert_eq!(dup_gap.flags(), 0xF0);
        assert_eq!(dup_gap.size(), 11);
    }

    #[test]
    fn dup_gap_layout() {
        let mut packet = Vec::new();
        let ack = Ack::new(2, 4, Ordinal(0x0102), Ordinal(0x0304), Time(0x0A0B0C0D));
        assert!(ack.try_write(&mut packet, 64));
        assert_eq!(
            packet,
            vec![0xF0, 2, 0, 4, 1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn refuses_when_full() {
        let mut packet = vec![0u8; 10];
        let ack = Ack::new(0, 1, Ordinal(1), Ordinal(1), Time(1));
        assert!(!ack.try_write(&mut packet, 17));
        assert_eq!(packet.len(), 10);
        assert!(ack.try_write(&mut packet, 18));
        assert_eq!(packet.len(), 18);
    }
}
