use std::sync::atomic::{AtomicU8, Ordering};

/// Peer States
/// These are the states of a peer as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeerState {
    /// The peer was disconnected. Nothing can be sent through it anymore.
    Disconnected = 0,
    /// A connection is being established.
    Connecting,
    /// The connection is established and data can be sent.
    Connected,
    /// The peer was closed locally and its disconnection event is pending.
    Disconnecting,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }

    /// Returns whether or not the peer can still be sent data or is about to.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Returns whether or not the peer was disconnected or is being disconnected.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Disconnecting)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why a peer was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerReason {
    #[default]
    None,
    /// The peer was closed locally.
    Closed,
    /// The remote host reset the connection.
    Reset,
    /// The remote host stopped acknowledging.
    TimedOut,
    /// The connection was replaced or violated the protocol.
    Error,
    /// The remote host refused the connection.
    Refused,
    /// The remote host never answered the connection request.
    Unreachable,
}

impl std::fmt::Display for PeerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "None",
                Self::Closed => "Closed",
                Self::Reset => "Reset",
                Self::TimedOut => "Timed out",
                Self::Error => "Error",
                Self::Refused => "Refused",
                Self::Unreachable => "Unreachable",
            }
        )
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerMode {
    /// Created by a local connect.
    Active,
    /// Created by accepting a remote connection request.
    Passive,
}

/// Who triggered a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResetMode {
    /// Triggered locally. The remote host is told with a RESET.
    Active,
    /// Triggered by the remote host.
    Passive,
}

/// An atomic [`PeerState`].
#[derive(Debug)]
pub(crate) struct AtomicPeerState(AtomicU8);

impl AtomicPeerState {
    pub fn new(state: PeerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: PeerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_state_helpers() {
        assert!(PeerState::Connected.is_available());
        assert!(!PeerState::Disconnecting.is_available());
        assert!(PeerState::Disconnecting.is_closed());
        let state = AtomicPeerState::new(PeerState::Connecting);
        state.set(PeerState::Connected);
        assert_eq!(state.get().to_string(), "Connected");
    }
}
