//! Channels: independent ordered streams multiplexed over one connection.
//!
//! Each channel owns an [`Inbound`](inbound::Inbound) half that puts
//! received units back in order and an [`Outbound`](outbound::Outbound) half
//! that keeps sent messages until they are acknowledged. Channels with
//! something to send (an ack, new data or retransmissions) are linked in a
//! [`SendList`] visited round robin by the worker.
pub mod inbound;
pub mod outbound;
pub mod staging;

use crate::protocol::Time;

use self::inbound::Inbound;
use self::outbound::Outbound;

#[derive(Debug)]
pub(crate) struct Channel {
    pub inbound: Inbound,
    pub outbound: Outbound,
}

impl Channel {
    /// A channel of a connection whose request was sent at `remote_time`.
    pub fn new(remote_time: Time) -> Self {
        Self {
            inbound: Inbound::new(remote_time),
            outbound: Outbound::new(),
        }
    }
}

/// A cyclic doubly linked list of channel ids with a cursor.
///
/// New channels are linked right before the cursor, that is, at the end of
/// the current round.
#[derive(Debug, Clone, Default)]
pub(crate) struct SendList {
    links: Vec<Option<(u8, u8)>>,
    current: Option<u8>,
}

impl SendList {
    pub fn new(channels: usize) -> Self {
        Self {
            links: vec![None; channels],
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<u8> {
        self.current
    }

    pub fn contains(&self, channel: u8) -> bool {
        matches!(self.links.get(channel as usize), Some(Some(_)))
    }

    fn link(&self, channel: u8) -> Option<(u8, u8)> {
        self.links.get(channel as usize).copied().flatten()
    }

    /// Links `channel` before the cursor unless it is linked already.
    pub fn add_before_current(&mut self, channel: u8) {
        if self.contains(channel) || channel as usize >= self.links.len() {
            return;
        }
        match self.current.and_then(|current| self.link(current).map(|link| (current, link))) {
            None => {
                self.links[channel as usize] = Some((channel, channel));
                self.current = Some(channel);
            }
            Some((current, (prev, _))) => {
                self.links[channel as usize] = Some((prev, current));
                if let Some(link) = self.links[prev as usize].as_mut() {
                    link.1 = channel;
                }
                if let Some(link) = self.links[current as usize].as_mut() {
                    link.0 = channel;
                }
            }
        }
    }

    /// Unlinks `channel`. The cursor moves on if it pointed at it.
    pub fn remove(&mut self, channel: u8) {
        let (prev, next) = match self.link(channel) {
            Some(link) => link,
            None => return,
        };
        self.links[channel as usize] = None;
        if prev == channel {
            self.current = None;
            return;
        }
        if let Some(link) = self.links[prev as usize].as_mut() {
            link.1 = next;
        }
        if let Some(link) = self.links[next as usize].as_mut() {
            link.0 = prev;
        }
        if self.current == Some(channel) {
            self.current = Some(next);
        }
    }

    /// Moves the cursor to the next channel.
    pub fn rotate(&mut self) {
        if let Some(current) = self.current {
            self.current = self.link(current).map(|(_, next)| next);
        }
    }

    /// Every linked channel, starting at the cursor.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut channels = Vec::new();
        let start = match self.current {
            Some(start) => start,
            None => return channels,
        };
        let mut cursor = start;
        loop {
            channels.push(cursor);
            cursor = match self.link(cursor) {
                Some((_, next)) => next,
                None => break,
            };
            if cursor == start || channels.len() == self.links.len() {
                break;
            }
        }
        channels
    }

    pub fn clear(&mut self) {
        self.links.iter_mut().for_each(|link| *link = None);
        self.current = None;
    }
}
