/// How a datagram is delivered.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Delivery {
    /// Never retransmitted. Delivered in order, may be lost or dropped when
    /// its time limit expires before transmission.
    #[default]
    Unreliable = 0,
    /// Retransmitted while a retransmission is pending, but never blocks
    /// the delivery of later messages.
    Semireliable,
    /// Retransmitted until acknowledged and delivered strictly in order.
    Reliable,
}

impl Delivery {
    /// Whether or not the message travels with the reliable flag.
    pub fn is_reliable(&self) -> bool {
        match self {
            Self::Reliable => true,
            _ => false,
        }
    }

    /// Whether or not the encoded message is kept for retransmission.
    pub fn is_retained(&self) -> bool {
        match self {
            Self::Semireliable | Self::Reliable => true,
            _ => false,
        }
    }
}

/// Quality of service of a single send.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Default)]
pub struct QoS {
    pub delivery: Delivery,
    /// Milliseconds an unreliable datagram may wait for its first
    /// transmission. Zero means no limit.
    pub timelimit: u32,
}

impl QoS {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            timelimit: 0,
        }
    }

    pub fn with_timelimit(delivery: Delivery, milliseconds: u32) -> Self {
        Self {
            delivery,
            timelimit: milliseconds,
        }
    }

    /// Time offset at which an untransmitted unreliable message expires.
    pub(crate) fn expiration_offset(&self) -> u32 {
        self.timelimit.wrapping_sub(1) & i32::MAX as u32
    }
}

impl From<Delivery> for QoS {
    fn from(delivery: Delivery) -> Self {
        Self::new(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timelimit_never_expires() {
        assert_eq!(QoS::new(Delivery::Unreliable).expiration_offset(), i32::MAX as u32);
        assert_eq!(
            QoS::with_timelimit(Delivery::Unreliable, 100).expiration_offset(),
            99
        );
    }
}
