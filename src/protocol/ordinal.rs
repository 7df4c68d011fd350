//! Wraparound arithmetic for sequence numbers and timestamps.
//!
//! Both [`Ordinal`] and [`Time`] compare under a fixed window: `a < b` when the
//! forward distance from `a` to `b` is non-zero and less than half the number
//! space. Two values compared against each other must never be further apart
//! than the window or the relation inverts.
use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub};

/// A 16 bit sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ordinal(pub u16);

impl Ordinal {
    /// Half of the ordinal space.
    pub const WINDOW_SIZE: u16 = 32768;

    /// Returns -1, 0 or 1 depending on how `self` relates to `other`.
    pub fn compare(self, other: Ordinal) -> i32 {
        match self.partial_cmp(&other) {
            Some(Ordering::Less) => -1,
            Some(Ordering::Greater) => 1,
            _ => 0,
        }
    }

    /// Signed distance from `other` to `self`.
    pub fn distance(self, other: Ordinal) -> i32 {
        self.0.wrapping_sub(other.0) as i16 as i32
    }
}

impl PartialOrd for Ordinal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let forward = other.0.wrapping_sub(self.0);
        Some(if forward == 0 {
            Ordering::Equal
        } else if forward < Self::WINDOW_SIZE {
            Ordering::Less
        } else {
            Ordering::Greater
        })
    }
}

impl Add<u16> for Ordinal {
    type Output = Ordinal;

    fn add(self, rhs: u16) -> Ordinal {
        Ordinal(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for Ordinal {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u16> for Ordinal {
    type Output = Ordinal;

    fn sub(self, rhs: u16) -> Ordinal {
        Ordinal(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Ordinal> for Ordinal {
    type Output = u16;

    fn sub(self, rhs: Ordinal) -> u16 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl std::fmt::Display for Ordinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 32 bit millisecond timestamp. Wraps roughly every 49 days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Time(pub u32);

impl Time {
    pub const WINDOW_SIZE: u32 = 1 << 31;

    pub fn max(self, other: Time) -> Time {
        if other > self {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let forward = other.0.wrapping_sub(self.0);
        Some(if forward == 0 {
            Ordering::Equal
        } else if forward < Self::WINDOW_SIZE {
            Ordering::Less
        } else {
            Ordering::Greater
        })
    }
}

impl Add<u32> for Time {
    type Output = Time;

    fn add(self, rhs: u32) -> Time {
        Time(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for Time {
    type Output = Time;

    fn sub(self, rhs: u32) -> Time {
        Time(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Time> for Time {
    type Output = u32;

    fn sub(self, rhs: Time) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of static windows the cross sequence space is split into.
pub const STATIC_WINDOWS: usize = 4;

/// Size of the cross sequence space.
pub const CROSS_SEQUENCE_SPACE: u32 = STATIC_WINDOWS as u32 * Ordinal::WINDOW_SIZE as u32;

/// Advances a cross sequence number by `delta` and returns the new value
/// along with its static window index.
pub fn cross_sequence(xseq: u32, delta: i32) -> (u32, usize) {
    let value = (xseq as i64 + delta as i64).rem_euclid(CROSS_SEQUENCE_SPACE as i64) as u32;
    (value, (value >> 15) as usize)
}

/// The highest accepted remote time per static window.
///
/// A unit is only accepted when its source time is newer than the time
/// recorded for its window. This rejects old retransmissions that land in a
/// later incarnation of the same ordinal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTimes([Time; STATIC_WINDOWS]);

impl WindowTimes {
    pub fn new(initial: Time) -> Self {
        Self([initial; STATIC_WINDOWS])
    }

    pub fn get(&self, window: usize) -> Time {
        self.0[window & (STATIC_WINDOWS - 1)]
    }

    /// Whether a unit sent at `remote_time` is acceptable in `window`.
    pub fn accepts(&self, window: usize, remote_time: Time) -> bool {
        remote_time > self.get(window)
    }

    /// Records an accepted unit. Primes the window two positions ahead so
    /// the next incarnation of this range starts from a safe floor.
    pub fn accept(&mut self, window: usize, remote_time: Time) {
        let ahead = (window + 2) & (STATIC_WINDOWS - 1);
        self.0[ahead] = self.0[ahead].max(remote_time);
    }

    /// Raises every window that is behind `time`. Must run periodically so no
    /// entry falls more than half the time space behind the remote clock.
    pub fn adjust(&mut self, time: Time) {
        for entry in self.0.iter_mut() {
            if *entry < time {
                *entry = time;
            }
        }
    }
}
