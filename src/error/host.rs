//! Host errors
//! Host errors are errors that can occur when using the [`Host`](crate::host::Host) api.
use std::io::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostError {
    /// The host is unable to bind to the given address.
    AddrBindErr,
    /// The host has been closed and can not be used again.
    Closed,
    /// The worker task stopped because of a socket failure.
    /// The host is unusable from then on.
    WorkerFault(ErrorKind),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::AddrBindErr => write!(f, "Unable to bind to address"),
            HostError::Closed => write!(f, "Host closed"),
            HostError::WorkerFault(kind) => write!(f, "Worker fault: {}", kind),
        }
    }
}

impl std::error::Error for HostError {}

/// Errors returned by [`Host::connect`](crate::host::Host::connect) and its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectError {
    /// A live peer already exists for this endpoint.
    AlreadyConnected,
    /// A secure connection was requested but the host has no security configured.
    SecurityUnavailable,
    /// The host can not be used.
    Host(HostError),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::AlreadyConnected => write!(f, "Already connected"),
            ConnectError::SecurityUnavailable => write!(f, "Security unavailable"),
            ConnectError::Host(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<HostError> for ConnectError {
    fn from(err: HostError) -> Self {
        ConnectError::Host(err)
    }
}
