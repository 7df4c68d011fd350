//! Home of the wire protocol.
//!
//! Every packet starts with a 5 byte header: the sender's time (STM, 4 bytes)
//! and the packet flags (PFLAGS, 1 byte). Everything is big endian.
//!
//! This module holds the protocol wide constants and the size rules derived
//! from the MTU; the submodules hold the codecs.
/// Acknowledgement messages.
pub mod ack;
/// Message parsing for DATA packets.
pub mod frame;
/// Wraparound arithmetic for ordinals and times.
pub mod ordinal;
/// Packet level framing (CONNECT, ACCEPT, DATA, RESET).
pub mod packet;
pub mod reliability;

pub use self::ordinal::{Ordinal, Time};
pub use self::reliability::{Delivery, QoS};

pub const IP_HEADER_SIZE: usize = 40;
pub const UDP_HEADER_SIZE: usize = 8;
/// STM(4) PFLAGS(1)
pub const PACKET_HEADER_SIZE: usize = 5;

pub const CHECKSUM_SIZE: usize = 4;
pub const KEY_SIZE: usize = 32;
/// Size of the 64 bit part of a nonce carried on the wire.
pub const NONCE_SIZE: usize = 8;
pub const MAC_SIZE: usize = 16;

/// Packets older than this (relative to the latest remote time) are dropped.
pub const PACKET_LIFETIME: u32 = 60_000;

/// Maximum Transmission Unit limits.
pub mod mtu {
    pub const DEFAULT: u16 = 1280;
    pub const IPV4: u16 = 576;
    /// IP + UDP + header + SSN-less secure fragment with a 256 byte payload + nonce + mac.
    pub const MIN: u16 = (super::IP_HEADER_SIZE
        + super::UDP_HEADER_SIZE
        + super::PACKET_HEADER_SIZE
        + 2
        + 1
        + 10
        + 256
        + super::NONCE_SIZE
        + super::MAC_SIZE) as u16;
    pub const MAX: u16 = u16::MAX;

    pub fn is_valid(value: u16) -> bool {
        value >= MIN
    }

    pub fn clamp(value: u16) -> u16 {
        value.max(MIN)
    }
}

/// Maximum Transmission Channel limits.
pub mod mtc {
    pub const DEFAULT: u8 = 0;
    pub const MAX: u8 = u8::MAX;
}

/// Bandwidth limits in bits per second.
pub mod bandwidth {
    pub const MIN: u32 = 0;
    pub const MAX: u32 = u16::MAX as u32 * 8000;
    pub const DEFAULT: u32 = MAX;

    pub fn clamp(value: u32) -> u32 {
        value.min(MAX)
    }
}

/// Socket time to live.
pub mod ttl {
    pub const DEFAULT: u8 = 64;
}

pub mod update_rate {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 1000;
    pub const DEFAULT: u32 = 50;
}

pub mod timeout {
    pub const CONNECTION: u32 = 30_000;
    pub const IDLE: u32 = 1000;
}

/// Size limits of a user datagram.
pub mod datagram {
    pub const MIN: usize = 1;
    pub const MAX: usize = u16::MAX as usize;
}

/// Header sizes of a data message (excluding its flags byte).
pub mod message {
    /// CH(1) SEQ(2) RSN(2) LEN(2)
    pub const SEGMENT_HEADER_SIZE: usize = 7;
    /// CH(1) SEQ(2) RSN(2) SEGLEN(2) INDEX(1) FRAGLEN(2)
    pub const FRAGMENT_HEADER_SIZE: usize = 10;
    /// A fragment payload is never shorter than this unless it is the last one.
    pub const MIN_FRAGMENT_SIZE: u16 = 256;
}

/// Packet flags. The low nibble selects the packet kind.
pub mod packet_flags {
    pub const ACCEPT: u8 = 0x0A;
    pub const CONNECT: u8 = 0x0C;
    pub const DATA: u8 = 0x0D;
    pub const RESET: u8 = 0x0F;
    pub const SECURE: u8 = 0x10;
}

/// Message flags. A message is identified by a combination of these.
pub mod message_flags {
    pub const ACCEPT: u8 = 0x0A;
    pub const DUP: u8 = 0x10;
    pub const GAP: u8 = 0x40;
    pub const ACK: u8 = 0x80;
    pub const SEGMENT: u8 = 0x00;
    pub const FRAGMENT: u8 = 0x10;
    pub const DATA: u8 = 0x20;
    pub const RELIABLE: u8 = 0x40;

    pub const ACCEPT_ACK: u8 = ACK | ACCEPT;
    pub const DATA_ACK: u8 = ACK | DATA;
    pub const DATA_DUP_ACK: u8 = ACK | DATA | DUP;
    pub const DATA_GAP_ACK: u8 = ACK | DATA | GAP;
    pub const DATA_DUP_GAP_ACK: u8 = ACK | DATA | DUP | GAP;
    pub const UNRELIABLE_SEGMENT: u8 = DATA | SEGMENT;
    pub const RELIABLE_SEGMENT: u8 = RELIABLE | DATA | SEGMENT;
    pub const UNRELIABLE_FRAGMENT: u8 = DATA | FRAGMENT;
    pub const RELIABLE_FRAGMENT: u8 = RELIABLE | DATA | FRAGMENT;
}

/// Overhead of a DATA packet carrying a single segment, beyond IP, UDP and header.
fn segment_overhead(secure: bool) -> u16 {
    if secure {
        // RW(2) MF(1) SEGMENT(7) NONCE(8) MAC(16)
        (2 + 1 + message::SEGMENT_HEADER_SIZE + NONCE_SIZE + MAC_SIZE) as u16
    } else {
        // SSN(4) RW(2) MF(1) SEGMENT(7) CRC(4)
        (4 + 2 + 1 + message::SEGMENT_HEADER_SIZE + CHECKSUM_SIZE) as u16
    }
}

fn fragment_overhead(secure: bool) -> u16 {
    segment_overhead(secure) + (message::FRAGMENT_HEADER_SIZE - message::SEGMENT_HEADER_SIZE) as u16
}

const FIXED_OVERHEAD: u16 = (IP_HEADER_SIZE + UDP_HEADER_SIZE + PACKET_HEADER_SIZE) as u16;

/// Largest user payload that can travel in a single segment.
pub fn max_segment_size(mtu: u16, secure: bool) -> u16 {
    mtu.saturating_sub(FIXED_OVERHEAD + segment_overhead(secure))
}

/// Payload carried by every fragment except the last one.
pub fn max_fragment_size(mtu: u16, secure: bool) -> u16 {
    mtu.saturating_sub(FIXED_OVERHEAD + fragment_overhead(secure))
        .max(message::MIN_FRAGMENT_SIZE)
}

/// Room for headers and messages in a UDP payload, excluding the trailer.
pub fn packet_capacity(mtu: u16, secure: bool) -> usize {
    let trailer = if secure {
        NONCE_SIZE + MAC_SIZE
    } else {
        CHECKSUM_SIZE
    };
    (mtu as usize).saturating_sub(IP_HEADER_SIZE + UDP_HEADER_SIZE + trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_mtu_fits_a_minimum_fragment() {
        assert_eq!(mtu::MIN, 346);
        assert_eq!(max_fragment_size(mtu::MIN, true), 256);
        assert_eq!(max_segment_size(mtu::MIN, true), 259);
        assert_eq!(max_segment_size(mtu::MIN, false), 275);
    }

    #[test]
    fn default_mtu_sizes() {
        assert_eq!(max_segment_size(mtu::DEFAULT, false), 1280 - 53 - 18);
        assert_eq!(max_fragment_size(mtu::DEFAULT, false), 1280 - 53 - 21);
        assert_eq!(max_segment_size(mtu::DEFAULT, true), 1280 - 53 - 34);
        assert_eq!(max_fragment_size(mtu::DEFAULT, true), 1280 - 53 - 37);
    }

    #[test]
    fn a_full_segment_fits_the_packet() {
        for secure in [false, true] {
            let mtu = mtu::DEFAULT;
            let header = if secure { 5 + 2 } else { 5 + 4 + 2 };
            let body = 1 + message::SEGMENT_HEADER_SIZE + max_segment_size(mtu, secure) as usize;
            assert_eq!(header + body, packet_capacity(mtu, secure));
        }
    }

    #[test]
    fn mtu_is_clamped() {
        assert_eq!(mtu::clamp(100), mtu::MIN);
        assert_eq!(mtu::clamp(1500), 1500);
        assert!(!mtu::is_valid(345));
    }
}
