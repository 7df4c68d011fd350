//! Congestion and flow control of a single peer.
//!
//! Round trip time follows Jacobson/Karels. The congestion window grows by
//! the acknowledged bytes while under the estimated link capacity (slow start)
//! and by one byte per ack above it (avoidance). An ack timeout collapses the
//! window to one segment.
use crate::protocol::ack;

/// Limits applied to the ack timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AckTimeouts {
    pub min: u32,
    pub max: u32,
    /// Multiplicative factor applied on every ack timeout.
    pub backoff: f32,
}

impl AckTimeouts {
    pub fn clamp(&self, value: u32) -> u32 {
        ack::timeout::clamp(value.clamp(self.min, self.max.max(self.min)))
    }

    pub fn backoff(&self, value: u32) -> u32 {
        (value as f64 * self.backoff.max(0.0) as f64) as u32
    }
}

impl Default for AckTimeouts {
    fn default() -> Self {
        Self {
            min: ack::timeout::MIN,
            max: ack::timeout::MAX,
            backoff: ack::BACKOFF,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FlowControl {
    pub max_segment_size: u16,
    /// Smoothed round trip time in milliseconds. Zero while unknown.
    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub ack_timeout: u32,
    pub congestion_window: u16,
    pub link_capacity: u16,
    /// Last receive window advertised by the remote host.
    pub remote_window: u16,
    /// Remote bandwidth limit in bytes per second.
    pub remote_bandwidth: u32,
    pub send_window: u32,
    pub bytes_in_flight: u32,
    timeouts: AckTimeouts,
}

impl FlowControl {
    pub fn new(max_segment_size: u16, timeouts: AckTimeouts) -> Self {
        let mut control = Self {
            max_segment_size,
            round_trip_time: 0,
            round_trip_time_variance: 0,
            ack_timeout: timeouts.clamp(ack::timeout::DEFAULT),
            congestion_window: 0,
            link_capacity: u16::MAX,
            remote_window: u16::MAX,
            remote_bandwidth: 0,
            send_window: 0,
            bytes_in_flight: 0,
            timeouts,
        };
        control.congestion_window = control.initial_window();
        control
    }

    /// `min(65535, 4 * MSS)`
    pub fn initial_window(&self) -> u16 {
        (4 * self.max_segment_size as u32).min(u16::MAX as u32) as u16
    }

    /// Restarts slow start with the initial window.
    pub fn restart(&mut self) {
        self.congestion_window = self.initial_window();
    }

    pub fn set_max_segment_size(&mut self, max_segment_size: u16) {
        self.max_segment_size = max_segment_size;
    }

    /// Feeds a round trip sample (in milliseconds) and recomputes the ack
    /// timeout.
    pub fn on_sample(&mut self, sample: u32) {
        if self.round_trip_time == 0 {
            self.round_trip_time = sample.max(1);
            self.round_trip_time_variance = sample >> 1;
        } else {
            self.round_trip_time = ((7 * self.round_trip_time as u64 + sample as u64) >> 3).max(1) as u32;
            let deviation = (self.round_trip_time as i64 - sample as i64).unsigned_abs();
            self.round_trip_time_variance =
                ((3 * self.round_trip_time_variance as u64 + deviation) >> 2) as u32;
        }
        let timeout = self.round_trip_time as u64 + ((self.round_trip_time_variance as u64) << 2);
        self.ack_timeout = self.timeouts.clamp(timeout.min(u32::MAX as u64) as u32);
    }

    /// Applies a consecutive ack timeout. `failures` counts this one.
    pub fn on_timeout(&mut self, failures: u32, retransmitting: bool) {
        if failures == 1 {
            if !retransmitting {
                self.reduce_link_capacity();
            }
            self.congestion_window = self.max_segment_size;
        } else if failures == 2 {
            // the estimate is probably way off by now
            self.round_trip_time = 0;
        }
        self.ack_timeout = self
            .timeouts
            .clamp(self.timeouts.backoff(self.ack_timeout));
    }

    /// Halves the estimated link capacity, never below the initial window.
    pub fn reduce_link_capacity(&mut self) {
        self.link_capacity = (self.congestion_window >> 1).max(self.initial_window());
    }

    /// Releases `acknowledged` bytes from flight, growing the congestion
    /// window first if the link was at least half used.
    pub fn on_acknowledged(&mut self, acknowledged: u32) {
        if self.bytes_in_flight > (self.congestion_window >> 1) as u32 {
            let increment = match self.congestion_window < self.link_capacity {
                true => acknowledged,
                false => 1,
            };
            self.congestion_window =
                (self.congestion_window as u32 + increment).min(u16::MAX as u32) as u16;
        }
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acknowledged);
    }

    /// Recomputes the send window from the upstream buffer share and the
    /// bandwidth window (bytes the remote bandwidth still allows).
    pub fn update_send_window(&mut self, buffer_share: u32, bandwidth_window: u64) {
        let window = buffer_share
            .min(self.congestion_window as u32)
            .min(self.remote_window as u32)
            .max(self.max_segment_size as u32);
        self.send_window = (window as u64).min(bandwidth_window) as u32;
    }

    /// Bytes that may still be put in flight.
    pub fn available(&self) -> u32 {
        self.send_window.saturating_sub(self.bytes_in_flight)
    }
}
