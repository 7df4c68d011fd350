use std::sync::Arc;

use crate::memory::Memory;
use crate::peer::{Peer, PeerReason};

/// A datagram received on a channel.
#[derive(Debug)]
pub struct Data {
    pub channel: u8,
    pub payload: Memory,
}

/// An event as queued on its peer. The host keeps only the order in which
/// peers produced events, so dropping a peer drops its events with it.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Connection,
    Disconnection(PeerReason),
    Data(Data),
}

/// Events returned by [`Host::poll_event`](crate::host::Host::poll_event).
#[derive(Debug)]
pub enum Event {
    /// The connection to the peer is established.
    Connection(Arc<Peer>),
    /// The peer was disconnected. No more events follow for it.
    Disconnection(Arc<Peer>, PeerReason),
    /// A datagram was received.
    Data(Arc<Peer>, Data),
}

impl Event {
    pub fn peer(&self) -> &Arc<Peer> {
        match self {
            Event::Connection(peer) => peer,
            Event::Disconnection(peer, _) => peer,
            Event::Data(peer, _) => peer,
        }
    }
}
