//! A reliable, connection oriented transport over UDP.
//!
//! A [`Host`] binds a UDP socket and exchanges datagrams with remote hosts
//! through [`Peer`]s. Each connection multiplexes up to 256 ordered channels
//! and every datagram is sent with one of three [`Delivery`] guarantees:
//! unreliable, semireliable or reliable. All of them are delivered in order.
//! Congestion is handled per connection with a window that grows on acks
//! and shrinks on loss.
//!
//! Sessions may be secured with any authenticated cipher and key exchange
//! plugged in through [`security`]. No primitive is provided.
//!
//! [`Host`]: host::Host
//! [`Peer`]: peer::Peer
//! [`Delivery`]: protocol::Delivery
pub(crate) mod channel;
pub mod collections;
pub mod error;
pub mod host;
pub mod memory;
pub(crate) mod notify;
pub mod peer;
pub mod protocol;
pub mod security;
pub mod util;

pub use self::host::event::{Data, Event};
pub use self::host::{Host, Settings};
pub use self::peer::{Peer, PeerMode, PeerReason, PeerState, PeerStats};
pub use self::protocol::{Delivery, QoS};
