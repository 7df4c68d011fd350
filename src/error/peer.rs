//! # Peer Error
//! These error types are returned by [`Peer::send`].
//!
//! [`Peer::send`]: crate::peer::Peer::send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SendError {
    /// The peer is not connected.
    NotConnected,
    /// The channel is above the negotiated max channel.
    InvalidChannel,
    /// The payload is longer than a datagram may be.
    InvalidLength,
    /// Queuing the payload would exceed the transmission backlog limit.
    BacklogExceeded,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SendError::NotConnected => "Not connected",
                SendError::InvalidChannel => "Invalid channel",
                SendError::InvalidLength => "Invalid length",
                SendError::BacklogExceeded => "Transmission backlog exceeded",
            }
        )
    }
}

impl std::error::Error for SendError {}
