//! Handshake parameters carried by CONNECT and ACCEPT packets.
use binary_util::interfaces::{Reader, Writer};
use binary_util::io::{ByteReader, ByteWriter};

use crate::protocol::{bandwidth, mtu, Time};

/// Link parameters proposed by the host that initiates a connection.
///
/// Wire layout: `MTU(2) MTC(1) MBW(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    /// Maximum transmission unit.
    pub mtu: u16,
    /// Maximum transmission channel.
    pub mtc: u8,
    /// Maximum bandwidth in bits per second.
    pub mbw: u32,
}

impl Connect {
    pub const SIZE: usize = 7;

    pub fn new(mtu: u16, mtc: u8, mbw: u32) -> Self {
        Self { mtu, mtc, mbw }
    }

    /// Clamps the remote parameters to what the local host supports.
    /// Returns `None` when the proposal is invalid and must be ignored.
    pub fn negotiate(&self, max_mtu: u16, max_channel: u8) -> Option<Self> {
        if !mtu::is_valid(self.mtu) {
            return None;
        }
        Some(Self {
            mtu: self.mtu.min(max_mtu),
            mtc: self.mtc.min(max_channel),
            mbw: bandwidth::clamp(self.mbw),
        })
    }
}

impl Reader<Connect> for Connect {
    fn read(buf: &mut ByteReader) -> std::io::Result<Self> {
        Ok(Self {
            mtu: buf.read_u16()?,
            mtc: buf.read_u8()?,
            mbw: buf.read_u32()?,
        })
    }
}

impl Writer for Connect {
    fn write(&self, buf: &mut ByteWriter) -> std::io::Result<()> {
        buf.write_u16(self.mtu)?;
        buf.write_u8(self.mtc)?;
        buf.write_u32(self.mbw)?;
        Ok(())
    }
}

/// Link parameters of the accepting host along with the send time of the
/// CONNECT being accepted.
///
/// Wire layout: `MTU(2) MTC(1) MBW(4) ATM(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accept {
    pub mtu: u16,
    pub mtc: u8,
    pub mbw: u32,
    /// Acknowledged time.
    pub atm: Time,
}

impl Accept {
    pub const SIZE: usize = 11;

    pub fn new(connect: Connect, atm: Time) -> Self {
        Self {
            mtu: connect.mtu,
            mtc: connect.mtc,
            mbw: connect.mbw,
            atm,
        }
    }

    pub fn link(&self) -> Connect {
        Connect::new(self.mtu, self.mtc, self.mbw)
    }
}

impl Reader<Accept> for Accept {
    fn read(buf: &mut ByteReader) -> std::io::Result<Self> {
        let link = Connect::read(buf)?;
        Ok(Self::new(link, Time(buf.read_u32()?)))
    }
}

impl Writer for Accept {
    fn write(&self, buf: &mut ByteWriter) -> std::io::Result<()> {
        self.link().write(buf)?;
        buf.write_u32(self.atm.0)?;
        Ok(())
    }
}
