//! Small helpers shared by the host, the peers and the worker.
pub mod debug;

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::protocol::ordinal::Time;

/// Formats an endpoint the way it is printed in debug output.
pub fn to_address_token(remote: SocketAddr) -> String {
    let mut address = remote.ip().to_string();
    address.push_str(":");
    address.push_str(remote.port().to_string().as_str());
    return address;
}

/// Locks a mutex, recovering the guard if another thread panicked while
/// holding it. All protected state here stays consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Monotonic millisecond clock used as the host time source.
///
/// The origin is taken from the wall clock so that two hosts started at
/// different moments produce different session numbers.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
    origin: u32,
}

impl Clock {
    pub fn new() -> Self {
        let origin = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u32)
            .unwrap_or_default();
        Self {
            start: Instant::now(),
            origin,
        }
    }

    /// A clock that starts at a fixed time, used by tests.
    pub fn starting_at(origin: u32) -> Self {
        Self {
            start: Instant::now(),
            origin,
        }
    }

    pub fn now(&self) -> Time {
        Time(
            self.origin
                .wrapping_add(self.start.elapsed().as_millis() as u32),
        )
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_token_keeps_port() {
        let addr: SocketAddr = "127.0.0.1:1313".parse().unwrap();
        assert_eq!(to_address_token(addr), "127.0.0.1:1313");
    }

    #[test]
    fn clock_never_goes_back() {
        let clock = Clock::starting_at(u32::MAX - 1);
        let a = clock.now();
        let b = clock.now();
        assert!(a <= b);
    }
}
