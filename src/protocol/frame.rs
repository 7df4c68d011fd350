//! Messages carried by a DATA packet.
//!
//! [`Messages`] walks the decrypted body of a DATA packet and yields one
//! [`Message`] per entry. Parsing stops at the first unknown flag or
//! truncated message; everything read up to that point has already been
//! yielded and may have been processed.
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use super::ack::{Ack, ACCEPT_ACK_SIZE};
use super::message::{FRAGMENT_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use super::message_flags;
use super::ordinal::{Ordinal, Time};

/// A data segment. An empty reliable segment on channel 0 is a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub reliable: bool,
    pub channel: u8,
    pub sequence: Ordinal,
    pub reliable_sequence: Ordinal,
    pub data: &'a [u8],
}

/// One slice of a datagram larger than the max segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub reliable: bool,
    pub channel: u8,
    pub sequence: Ordinal,
    pub reliable_sequence: Ordinal,
    /// Length of the whole datagram.
    pub datagram_length: u16,
    pub index: u8,
    pub data: &'a [u8],
}

impl Fragment<'_> {
    /// Index of the last fragment of the datagram, given the max fragment size.
    pub fn last_index(&self, max_fragment_size: u16) -> u8 {
        ((self.datagram_length.saturating_sub(1)) / max_fragment_size.max(1)) as u8
    }

    /// Whether the fragment has the exact length its index demands.
    pub fn is_well_formed(&self, max_fragment_size: u16) -> bool {
        let last = self.last_index(max_fragment_size);
        let length = self.data.len();
        if self.index < last {
            length == max_fragment_size as usize
        } else if self.index == last {
            length == self.datagram_length as usize - last as usize * max_fragment_size as usize
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    /// Acknowledges an ACCEPT packet.
    AcceptAck(Time),
    Ack(Ack),
    Segment(Segment<'a>),
    Fragment(Fragment<'a>),
}

/// Why message parsing was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Unknown message flags.
    Invalid(u8),
    /// The message is cut short by the end of the packet.
    Incomplete(u8),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Invalid(flags) => write!(f, "Invalid message: {:#04x}", flags),
            FrameError::Incomplete(flags) => write!(f, "Truncated message: {:#04x}", flags),
        }
    }
}

impl std::error::Error for FrameError {}

pub struct Messages<'a> {
    stream: Cursor<&'a [u8]>,
    failed: bool,
}

impl<'a> Messages<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            stream: Cursor::new(body),
            failed: false,
        }
    }

    /// Bytes left to parse.
    pub fn remaining(&self) -> usize {
        self.stream.get_ref().len() - self.stream.position() as usize
    }

    fn take(&mut self, length: usize) -> &'a [u8] {
        let start = self.stream.position() as usize;
        let body: &'a [u8] = *self.stream.get_ref();
        self.stream.set_position((start + length) as u64);
        &body[start..start + length]
    }

    fn read_ack(&mut self, flags: u8) -> std::io::Result<Ack> {
        let channel = self.stream.read_u8()?;
        let count = match flags & message_flags::DUP {
            0 => 1,
            _ => self.stream.read_u16::<BigEndian>()?,
        };
        let next = Ordinal(self.stream.read_u16::<BigEndian>()?);
        let last = match flags & message_flags::GAP {
            0 => next,
            _ => Ordinal(self.stream.read_u16::<BigEndian>()?),
        };
        let atm = Time(self.stream.read_u32::<BigEndian>()?);
        Ok(Ack::new(channel, count, next, last, atm))
    }

    fn parse(&mut self, flags: u8) -> Result<Option<Message<'a>>, FrameError> {
        let incomplete = |_: std::io::Error| FrameError::Incomplete(flags);
        match flags {
            message_flags::ACCEPT_ACK => {
                if self.remaining() < ACCEPT_ACK_SIZE {
                    return Err(FrameError::Incomplete(flags));
                }
                let atm = self.stream.read_u32::<BigEndian>().map_err(incomplete)?;
                Ok(Some(Message::AcceptAck(Time(atm))))
            }
            message_flags::DATA_ACK
            | message_flags::DATA_DUP_ACK
            | message_flags::DATA_GAP_ACK
            | message_flags::DATA_DUP_GAP_ACK => {
                let ack = self.read_ack(flags).map_err(incomplete)?;
                Ok(Some(Message::Ack(ack)))
            }
            message_flags::UNRELIABLE_SEGMENT | message_flags::RELIABLE_SEGMENT => {
                if self.remaining() < SEGMENT_HEADER_SIZE {
                    return Err(FrameError::Incomplete(flags));
                }
                let channel = self.stream.read_u8().map_err(incomplete)?;
                let sequence = Ordinal(self.stream.read_u16::<BigEndian>().map_err(incomplete)?);
                let reliable_sequence =
                    Ordinal(self.stream.read_u16::<BigEndian>().map_err(incomplete)?);
                let length = self.stream.read_u16::<BigEndian>().map_err(incomplete)? as usize;
                if self.remaining() < length {
                    return Err(FrameError::Incomplete(flags));
                }
                Ok(Some(Message::Segment(Segment {
                    reliable: flags & message_flags::RELIABLE != 0,
                    channel,
                    sequence,
                    reliable_sequence,
                    data: self.take(length),
                })))
            }
            message_flags::UNRELIABLE_FRAGMENT | message_flags::RELIABLE_FRAGMENT => {
                if self.remaining() <= FRAGMENT_HEADER_SIZE {
                    return Err(FrameError::Incomplete(flags));
                }
                let channel = self.stream.read_u8().map_err(incomplete)?;
                let sequence = Ordinal(self.stream.read_u16::<BigEndian>().map_err(incomplete)?);
                let reliable_sequence =
                    Ordinal(self.stream.read_u16::<BigEndian>().map_err(incomplete)?);
                let datagram_length = self.stream.read_u16::<BigEndian>().map_err(incomplete)?;
                let index = self.stream.read_u8().map_err(incomplete)?;
                let length = self.stream.read_u16::<BigEndian>().map_err(incomplete)? as usize;
                if length == 0 {
                    return Ok(None);
                }
                if self.remaining() < length {
                    return Err(FrameError::Incomplete(flags));
                }
                Ok(Some(Message::Fragment(Fragment {
                    reliable: flags & message_flags::RELIABLE != 0,
                    channel,
                    sequence,
                    reliable_sequence,
                    datagram_length,
                    index,
                    data: self.take(length),
                })))
            }
            _ => Err(FrameError::Invalid(flags)),
        }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<Message<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed {
            let mut flags = [0u8; 1];
            if self.stream.read(&mut flags).ok()? == 0 {
                return None;
            }
            match self.parse(flags[0]) {
                Ok(Some(message)) => return Some(Ok(message)),
                // an empty fragment carries nothing and is skipped
                Ok(None) => continue,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_messages() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x8A, 0, 0, 0, 7]);
        body.extend_from_slice(&[0xA0, 0, 0, 3, 0, 0, 0, 9]);
        body.extend_from_slice(&[0x60, 1, 0, 4, 0, 2, 0, 3, b'a', b'b', b'c']);
        let messages = Messages::new(&body).collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::AcceptAck(Time(7)));
        assert_eq!(
            messages[1],
            Message::Ack(Ack::new(0, 1, Ordinal(3), Ordinal(3), Time(9)))
        );
        match messages[2] {
            Message::Segment(segment) => {
                assert!(segment.reliable);
                assert_eq!(segment.channel, 1);
                assert_eq!(segment.sequence, Ordinal(4));
                assert_eq!(segment.reliable_sequence, Ordinal(2));
                assert_eq!(segment.data, b"abc");
            }
            _ => panic!("expected a segment"),
        }
    }

    #[test]
    fn truncated_segment_aborts() {
        let body = [0x20, 0, 0, 1, 0, 0, 0, 5, 1, 2];
        let mut messages = Messages::new(&body);
        assert_eq!(messages.next(), Some(Err(FrameError::Incomplete(0x20))));
        assert_eq!(messages.next(), None);
    }

    #[test]
    fn unknown_flags_abort() {
        let body = [0x01, 0, 0];
        let mut messages = Messages::new(&body);
        assert_eq!(messages.next(), Some(Err(FrameError::Invalid(0x01))));
        assert_eq!(messages.next(), None);
    }

    #[test]
    fn fragment_lengths_are_validated() {
        let data = [0u8; 300];
        let mut fragment = Fragment {
            reliable: true,
            channel: 0,
            sequence: Ordinal(0),
            reliable_sequence: Ordinal(1),
            datagram_length: 556,
            index: 0,
            data: &data[..256],
        };
        assert_eq!(fragment.last_index(256), 2);
        assert!(fragment.is_well_formed(256));
        fragment.index = 2;
        assert!(!fragment.is_well_formed(256));
        fragment.data = &data[..44];
        assert!(fragment.is_well_formed(256));
        // an exact multiple ends with a full fragment
        fragment.datagram_length = 512;
        fragment.index = 1;
        fragment.data = &data[..256];
        assert!(fragment.is_well_formed(256));
    }
}
