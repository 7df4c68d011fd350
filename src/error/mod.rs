//! Errors raised synchronously to the application.
//!
//! Protocol violations never show up here: they are dropped by the worker and
//! counted in [`PeerStats::packets_dropped`](crate::peer::PeerStats).
//! Connection failures are reported as
//! [`Event::Disconnection`](crate::host::event::Event) instead.
pub mod host;
pub mod peer;

pub use self::host::{ConnectError, HostError};
pub use self::peer::SendError;
