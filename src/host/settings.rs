//! Host configuration.
use std::ops::BitOr;

use crate::peer::controller::AckTimeouts;
use crate::protocol::{ack, bandwidth, mtu, timeout, ttl, update_rate};
use crate::security::Security;

/// Kinds of incoming connections a host accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTypes(u8);

impl ConnectionTypes {
    pub const NONE: Self = Self(0);
    pub const INSECURE: Self = Self(1);
    pub const SECURE: Self = Self(2);
    pub const ALL: Self = Self(3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for ConnectionTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for ConnectionTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Buffer and rate limits of one direction of traffic.
///
/// The buffer is shared evenly among the connected peers: each gets
/// `buffer_size * utilization / peers` bytes as its window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stream {
    pub buffer_size: u32,
    /// Fraction of the buffer handed out, in `0.0..=1.0`.
    pub utilization: f32,
    /// Packets per second.
    pub packet_rate: u32,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            buffer_size: 16384,
            utilization: 0.5,
            packet_rate: u32::MAX,
        }
    }
}

impl Stream {
    /// Window share of each of `peers` peers.
    pub fn share(&self, peers: usize) -> u32 {
        if peers == 0 {
            return 0;
        }
        let usable = self.buffer_size as f64 * self.utilization.clamp(0.0, 1.0) as f64;
        (usable / peers as f64) as u32
    }

    /// Packets allowed per worker frame.
    pub fn frame_limit(&self, update_rate: u32) -> u32 {
        (self.packet_rate / update_rate.max(1)).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of incoming connections.
    pub capacity: usize,
    /// Highest channel number a peer may use.
    pub max_channel: u8,
    /// Maximum transmission unit, IP and UDP headers included.
    pub mtu: u16,
    /// Bandwidth limit announced to remote hosts, in bits per second.
    pub max_bandwidth: u32,
    /// Bytes a peer may have queued but unacknowledged.
    pub max_backlog: usize,
    pub ttl: u8,
    /// Worker frames per second.
    pub update_rate: u32,
    /// Milliseconds.
    pub connection_timeout: u32,
    /// Milliseconds without traffic before a ping is sent.
    pub idle_timeout: u32,
    pub ack_timeout_min: u32,
    pub ack_timeout_max: u32,
    /// Consecutive ack timeouts before a connection is dropped.
    pub ack_fail_limit: u32,
    pub ack_backoff: f32,
    pub upstream: Stream,
    pub downstream: Stream,
    pub connection_types: ConnectionTypes,
    pub security: Option<Security>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capacity: 0,
            max_channel: 0,
            mtu: mtu::DEFAULT,
            max_bandwidth: bandwidth::DEFAULT,
            max_backlog: i32::MAX as usize,
            ttl: ttl::DEFAULT,
            update_rate: update_rate::DEFAULT,
            connection_timeout: timeout::CONNECTION,
            idle_timeout: timeout::IDLE,
            ack_timeout_min: ack::timeout::MIN,
            ack_timeout_max: ack::timeout::MAX,
            ack_fail_limit: ack::FAIL_LIMIT,
            ack_backoff: ack::BACKOFF,
            upstream: Stream::default(),
            downstream: Stream::default(),
            connection_types: ConnectionTypes::default(),
            security: None,
        }
    }
}

impl Settings {
    /// A copy with every value forced into its valid range.
    pub fn clamped(&self) -> Self {
        let ack_timeout_min = ack::timeout::clamp(self.ack_timeout_min);
        let clamp_stream = |stream: &Stream| Stream {
            buffer_size: stream.buffer_size,
            utilization: match stream.utilization.is_nan() {
                true => 0.0,
                false => stream.utilization.clamp(0.0, 1.0),
            },
            packet_rate: stream.packet_rate.max(1),
        };
        Self {
            capacity: self.capacity,
            max_channel: self.max_channel,
            mtu: mtu::clamp(self.mtu),
            max_bandwidth: bandwidth::clamp(self.max_bandwidth),
            max_backlog: self.max_backlog.max(1),
            ttl: self.ttl.max(1),
            update_rate: self.update_rate.clamp(update_rate::MIN, update_rate::MAX),
            connection_timeout: self.connection_timeout.max(1),
            idle_timeout: self.idle_timeout.max(1),
            ack_timeout_min,
            ack_timeout_max: ack::timeout::clamp(self.ack_timeout_max).max(ack_timeout_min),
            ack_fail_limit: self.ack_fail_limit.max(1),
            ack_backoff: match self.ack_backoff.is_finite() {
                true => self.ack_backoff.max(1.0),
                false => ack::BACKOFF,
            },
            upstream: clamp_stream(&self.upstream),
            downstream: clamp_stream(&self.downstream),
            connection_types: self.connection_types,
            security: self.security.clone(),
        }
    }

    /// Milliseconds per worker frame.
    pub fn frame_duration(&self) -> u32 {
        (1000 / self.update_rate.max(1)).max(1)
    }

    pub(crate) fn ack_timeouts(&self) -> AckTimeouts {
        AckTimeouts {
            min: self.ack_timeout_min,
            max: self.ack_timeout_max,
            backoff: self.ack_backoff,
        }
    }
}
