//! Packet level framing.
//!
//! There are four packet kinds, each with an insecure and a secure variant:
//!
//! - CONNECT: `STM PFLAGS SSN MTU MTC MBW [PUBKEY] CRC`
//! - ACCEPT: `STM PFLAGS SSN MTU MTC MBW ATM RW ASSN CRC` or
//!   `STM PFLAGS SSN MTU MTC MBW ATM {RW} PUBKEY NONCE MAC`
//! - DATA: `STM PFLAGS SSN RW MSG.. CRC` or `STM PFLAGS {RW MSG..} NONCE MAC`
//! - RESET: `STM PFLAGS SSN CRC` or `STM PFLAGS PUBKEY NONCE MAC`
//!
//! Braces mark the encrypted part of a secure packet. Insecure packets end in
//! a CRC32-C of everything before it. Secure packets are authenticated with
//! the session cipher instead.
pub mod handshake;

use binary_util::interfaces::{Reader, Writer};
use binary_util::io::{ByteReader, ByteWriter};
use byteorder::{BigEndian, ByteOrder};

use self::handshake::{Accept, Connect};
use super::{packet_flags, Time, CHECKSUM_SIZE, KEY_SIZE, MAC_SIZE, NONCE_SIZE, PACKET_HEADER_SIZE};
use crate::security::{Cipher, Key, Mac, Nonce};

pub const CONNECT_SIZE: usize = PACKET_HEADER_SIZE + 4 + Connect::SIZE + CHECKSUM_SIZE;
pub const SECURE_CONNECT_SIZE: usize = CONNECT_SIZE + KEY_SIZE;
pub const ACCEPT_SIZE: usize = PACKET_HEADER_SIZE + 4 + Accept::SIZE + 2 + 4 + CHECKSUM_SIZE;
pub const SECURE_ACCEPT_SIZE: usize =
    PACKET_HEADER_SIZE + 4 + Accept::SIZE + 2 + KEY_SIZE + NONCE_SIZE + MAC_SIZE;
pub const RESET_SIZE: usize = PACKET_HEADER_SIZE + 4 + CHECKSUM_SIZE;
pub const SECURE_RESET_SIZE: usize = PACKET_HEADER_SIZE + KEY_SIZE + NONCE_SIZE + MAC_SIZE;
/// STM PFLAGS SSN RW
pub const DATA_HEADER_SIZE: usize = PACKET_HEADER_SIZE + 4 + 2;
/// STM PFLAGS RW
pub const SECURE_DATA_HEADER_SIZE: usize = PACKET_HEADER_SIZE + 2;
/// NONCE MAC
pub const SECURE_TRAILER_SIZE: usize = NONCE_SIZE + MAC_SIZE;

/// Bytes of a secure ACCEPT covered by its MAC but not encrypted.
const SECURE_ACCEPT_AAD_SIZE: usize = PACKET_HEADER_SIZE + 4 + Accept::SIZE;

/// The header shared by every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's time.
    pub time: Time,
    pub flags: u8,
}

impl Header {
    pub fn new(time: Time, flags: u8) -> Self {
        Self { time, flags }
    }

    pub fn is_secure(&self) -> bool {
        self.flags & packet_flags::SECURE != 0
    }

    /// Reads the header from the start of a packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Self::read(&mut ByteReader::from(&packet[..PACKET_HEADER_SIZE])).ok()
    }
}

impl Reader<Header> for Header {
    fn read(buf: &mut ByteReader) -> std::io::Result<Self> {
        Ok(Self {
            time: Time(buf.read_u32()?),
            flags: buf.read_u8()?,
        })
    }
}

impl Writer for Header {
    fn write(&self, buf: &mut ByteWriter) -> std::io::Result<()> {
        buf.write_u32(self.time.0)?;
        buf.write_u8(self.flags)?;
        Ok(())
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

pub fn append_checksum(packet: &mut Vec<u8>) {
    let crc = checksum(packet);
    packet.extend_from_slice(&crc.to_be_bytes());
}

/// Whether the trailing CRC matches the rest of the packet.
pub fn verify_checksum(packet: &[u8]) -> bool {
    if packet.len() < CHECKSUM_SIZE {
        return false;
    }
    let (data, crc) = packet.split_at(packet.len() - CHECKSUM_SIZE);
    checksum(data) == BigEndian::read_u32(crc)
}

fn read_nonce(time: Time, bytes: &[u8]) -> Nonce {
    Nonce::new(time.0, BigEndian::read_u64(bytes))
}

fn read_key(bytes: &[u8]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes[..KEY_SIZE]);
    Key(key)
}

fn read_mac(bytes: &[u8]) -> Mac {
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&bytes[..MAC_SIZE]);
    Mac(mac)
}

/// Writes header, session and an encodable body into a fresh buffer.
fn begin(time: Time, flags: u8, session: u32, body: &impl Writer) -> std::io::Result<ByteWriter> {
    let mut buf = ByteWriter::new();
    Header::new(time, flags).write(&mut buf)?;
    buf.write_u32(session)?;
    body.write(&mut buf)?;
    Ok(buf)
}

/// Encodes a CONNECT. A public key turns it into a secure CONNECT.
pub fn encode_connect(
    time: Time,
    session: u32,
    link: Connect,
    public_key: Option<&Key>,
) -> std::io::Result<Vec<u8>> {
    let flags = match public_key {
        Some(_) => packet_flags::CONNECT | packet_flags::SECURE,
        None => packet_flags::CONNECT,
    };
    let mut buf = begin(time, flags, session, &link)?;
    if let Some(key) = public_key {
        buf.write(key.as_bytes())?;
    }
    let mut packet = buf.as_slice().to_vec();
    append_checksum(&mut packet);
    Ok(packet)
}

pub fn encode_accept(
    time: Time,
    session: u32,
    accept: Accept,
    window: u16,
    acknowledged_session: u32,
) -> std::io::Result<Vec<u8>> {
    let mut buf = begin(time, packet_flags::ACCEPT, session, &accept)?;
    buf.write_u16(window)?;
    buf.write_u32(acknowledged_session)?;
    let mut packet = buf.as_slice().to_vec();
    append_checksum(&mut packet);
    Ok(packet)
}

/// Encodes a secure ACCEPT. Only the receive window is encrypted; the MAC
/// covers everything before it as associated data.
pub fn encode_secure_accept(
    time: Time,
    session: u32,
    accept: Accept,
    window: u16,
    public_key: &Key,
    counter: u64,
    cipher: &mut dyn Cipher,
) -> std::io::Result<Vec<u8>> {
    let buf = begin(time, packet_flags::ACCEPT | packet_flags::SECURE, session, &accept)?;
    let mut packet = buf.as_slice().to_vec();
    let nonce = Nonce::new(time.0, counter);
    let mut text = window.to_be_bytes();
    cipher.encrypt_in_place(&mut text, &nonce);
    let mac = cipher.sign(&packet, &text, &nonce);
    packet.extend_from_slice(&text);
    packet.extend_from_slice(public_key.as_bytes());
    packet.extend_from_slice(&counter.to_be_bytes());
    packet.extend_from_slice(&mac.0);
    Ok(packet)
}

/// Encodes an insecure RESET addressed to a remote session.
pub fn encode_reset(time: Time, remote_session: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(RESET_SIZE);
    packet.extend_from_slice(&time.0.to_be_bytes());
    packet.push(packet_flags::RESET);
    packet.extend_from_slice(&remote_session.to_be_bytes());
    append_checksum(&mut packet);
    packet
}

/// Encodes a secure RESET. Only the header is signed and the nonce counter
/// is always zero.
pub fn encode_secure_reset(time: Time, public_key: &Key, cipher: &mut dyn Cipher) -> Vec<u8> {
    let mut packet = Vec::with_capacity(SECURE_RESET_SIZE);
    packet.extend_from_slice(&time.0.to_be_bytes());
    packet.push(packet_flags::RESET | packet_flags::SECURE);
    let nonce = Nonce::new(time.0, 0);
    let mac = cipher.sign(&packet, &[], &nonce);
    packet.extend_from_slice(public_key.as_bytes());
    packet.extend_from_slice(&0u64.to_be_bytes());
    packet.extend_from_slice(&mac.0);
    packet
}

/// Starts a DATA packet. Messages are appended afterwards and the packet is
/// completed with [`seal_data`].
pub fn begin_data(time: Time, session: Option<u32>, window: u16, capacity: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(capacity);
    packet.extend_from_slice(&time.0.to_be_bytes());
    match session {
        Some(session) => {
            packet.push(packet_flags::DATA);
            packet.extend_from_slice(&session.to_be_bytes());
        }
        None => packet.push(packet_flags::DATA | packet_flags::SECURE),
    }
    packet.extend_from_slice(&window.to_be_bytes());
    packet
}

/// Completes a DATA packet: appends the CRC, or encrypts everything after
/// the header and appends the nonce and MAC when a cipher is given.
pub fn seal_data(packet: &mut Vec<u8>, secure: Option<(&mut dyn Cipher, u64)>) {
    match secure {
        Some((cipher, counter)) => {
            let time = BigEndian::read_u32(&packet[..4]);
            let nonce = Nonce::new(time, counter);
            let (aad, text) = packet.split_at_mut(PACKET_HEADER_SIZE);
            cipher.encrypt_in_place(text, &nonce);
            let mac = cipher.sign(aad, text, &nonce);
            packet.extend_from_slice(&counter.to_be_bytes());
            packet.extend_from_slice(&mac.0);
        }
        None => append_checksum(packet),
    }
}

/// A CONNECT that passed its length and checksum checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPacket {
    pub header: Header,
    pub session: u32,
    pub link: Connect,
    pub public_key: Option<Key>,
}

pub fn read_connect(packet: &[u8]) -> Option<ConnectPacket> {
    let header = Header::parse(packet)?;
    let expected = if header.is_secure() {
        SECURE_CONNECT_SIZE
    } else {
        CONNECT_SIZE
    };
    if packet.len() != expected || !verify_checksum(packet) {
        return None;
    }
    let mut buf = ByteReader::from(&packet[PACKET_HEADER_SIZE..]);
    let session = buf.read_u32().ok()?;
    let link = Connect::read(&mut buf).ok()?;
    let public_key = match header.is_secure() {
        true => Some(read_key(&packet[PACKET_HEADER_SIZE + 4 + Connect::SIZE..])),
        false => None,
    };
    Some(ConnectPacket {
        header,
        session,
        link,
        public_key,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptPacket {
    pub header: Header,
    pub session: u32,
    pub accept: Accept,
    pub window: u16,
    /// The session of the CONNECT being accepted.
    pub acknowledged_session: u32,
}

pub fn read_accept(packet: &[u8]) -> Option<AcceptPacket> {
    let header = Header::parse(packet)?;
    if header.is_secure() || packet.len() != ACCEPT_SIZE || !verify_checksum(packet) {
        return None;
    }
    let mut buf = ByteReader::from(&packet[PACKET_HEADER_SIZE..]);
    Some(AcceptPacket {
        header,
        session: buf.read_u32().ok()?,
        accept: Accept::read(&mut buf).ok()?,
        window: buf.read_u16().ok()?,
        acknowledged_session: buf.read_u32().ok()?,
    })
}

/// A secure ACCEPT with its window still encrypted. Opening it requires the
/// session cipher, which in turn may depend on the public key it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureAcceptPacket {
    pub header: Header,
    pub session: u32,
    pub accept: Accept,
    pub public_key: Key,
    aad: [u8; SECURE_ACCEPT_AAD_SIZE],
    window: [u8; 2],
    nonce: Nonce,
    mac: Mac,
}

impl SecureAcceptPacket {
    /// Authenticates the packet and returns the decrypted receive window.
    pub fn open(&self, cipher: &mut dyn Cipher) -> Option<u16> {
        if !cipher.verify(&self.aad, &self.window, &self.nonce, &self.mac) {
            return None;
        }
        let mut window = self.window;
        cipher.decrypt_in_place(&mut window, &self.nonce);
        Some(u16::from_be_bytes(window))
    }
}

pub fn read_secure_accept(packet: &[u8]) -> Option<SecureAcceptPacket> {
    let header = Header::parse(packet)?;
    if !header.is_secure() || packet.len() != SECURE_ACCEPT_SIZE {
        return None;
    }
    let mut buf = ByteReader::from(&packet[PACKET_HEADER_SIZE..]);
    let session = buf.read_u32().ok()?;
    let accept = Accept::read(&mut buf).ok()?;

    let mut aad = [0u8; SECURE_ACCEPT_AAD_SIZE];
    aad.copy_from_slice(&packet[..SECURE_ACCEPT_AAD_SIZE]);
    let rest = &packet[SECURE_ACCEPT_AAD_SIZE..];
    let window = [rest[0], rest[1]];
    let public_key = read_key(&rest[2..]);
    let nonce = read_nonce(header.time, &rest[2 + KEY_SIZE..]);
    let mac = read_mac(&rest[2 + KEY_SIZE + NONCE_SIZE..]);
    Some(SecureAcceptPacket {
        header,
        session,
        accept,
        public_key,
        aad,
        window,
        nonce,
        mac,
    })
}

/// Returns the remote session addressed by an insecure RESET.
pub fn read_reset(packet: &[u8]) -> Option<u32> {
    let header = Header::parse(packet)?;
    if header.is_secure() || packet.len() != RESET_SIZE || !verify_checksum(packet) {
        return None;
    }
    Some(BigEndian::read_u32(&packet[PACKET_HEADER_SIZE..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureResetPacket {
    pub header: Header,
    pub public_key: Key,
    header_bytes: [u8; PACKET_HEADER_SIZE],
    nonce: Nonce,
    mac: Mac,
}

impl SecureResetPacket {
    pub fn verify(&self, cipher: &mut dyn Cipher) -> bool {
        cipher.verify(&self.header_bytes, &[], &self.nonce, &self.mac)
    }
}

pub fn read_secure_reset(packet: &[u8]) -> Option<SecureResetPacket> {
    let header = Header::parse(packet)?;
    if !header.is_secure() || packet.len() != SECURE_RESET_SIZE {
        return None;
    }
    let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
    header_bytes.copy_from_slice(&packet[..PACKET_HEADER_SIZE]);
    let rest = &packet[PACKET_HEADER_SIZE..];
    Some(SecureResetPacket {
        header,
        public_key: read_key(rest),
        header_bytes,
        nonce: read_nonce(header.time, &rest[KEY_SIZE..]),
        mac: read_mac(&rest[KEY_SIZE + NONCE_SIZE..]),
    })
}

/// An insecure DATA packet whose checksum matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub header: Header,
    pub session: u32,
    pub window: u16,
    /// Messages, without the trailing checksum.
    pub body: &'a [u8],
}

pub fn read_data(packet: &[u8]) -> Option<DataPacket<'_>> {
    let header = Header::parse(packet)?;
    if header.is_secure() || packet.len() <= DATA_HEADER_SIZE + CHECKSUM_SIZE {
        return None;
    }
    if !verify_checksum(packet) {
        return None;
    }
    Some(DataPacket {
        header,
        session: BigEndian::read_u32(&packet[PACKET_HEADER_SIZE..]),
        window: BigEndian::read_u16(&packet[PACKET_HEADER_SIZE + 4..]),
        body: &packet[DATA_HEADER_SIZE..packet.len() - CHECKSUM_SIZE],
    })
}

/// Authenticates and decrypts a secure DATA packet in place.
///
/// Returns the receive window and the decrypted messages. The packet is left
/// untouched when authentication fails.
pub fn open_secure_data<'a>(
    packet: &'a mut [u8],
    cipher: &mut dyn Cipher,
) -> Option<(Header, u16, &'a [u8])> {
    let header = Header::parse(packet)?;
    if !header.is_secure() || packet.len() <= SECURE_DATA_HEADER_SIZE + SECURE_TRAILER_SIZE {
        return None;
    }
    let end = packet.len() - SECURE_TRAILER_SIZE;
    let nonce = read_nonce(header.time, &packet[end..]);
    let mac = read_mac(&packet[end + NONCE_SIZE..]);
    let (aad, rest) = packet.split_at_mut(PACKET_HEADER_SIZE);
    let text = &mut rest[..end - PACKET_HEADER_SIZE];
    if !cipher.verify(aad, text, &nonce, &mac) {
        return None;
    }
    cipher.decrypt_in_place(text, &nonce);
    let text: &'a [u8] = text;
    let window = BigEndian::read_u16(text);
    Some((header, window, &text[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::testing;

    #[test]
    fn connect_sizes() {
        let link = Connect::new(1280, 0, 1000);
        let packet = encode_connect(Time(5), 77, link, None).unwrap();
        assert_eq!(packet.len(), 20);
        assert_eq!(packet[4], 0x0C);
        let read = read_connect(&packet).unwrap();
        assert_eq!(read.session, 77);
        assert_eq!(read.link, link);
        assert_eq!(read.public_key, None);

        let key = Key([9; KEY_SIZE]);
        let packet = encode_connect(Time(5), 77, link, Some(&key)).unwrap();
        assert_eq!(packet.len(), 52);
        assert_eq!(packet[4], 0x1C);
        assert_eq!(read_connect(&packet).unwrap().public_key, Some(key));
    }

    #[test]
    fn corrupted_connect_is_rejected() {
        let mut packet = encode_connect(Time(5), 77, Connect::new(1280, 0, 0), None).unwrap();
        packet[7] ^= 0x40;
        assert!(read_connect(&packet).is_none());
        assert!(read_connect(&packet[..19]).is_none());
    }

    #[test]
    fn accept_layout() {
        let accept = Accept::new(Connect::new(576, 1, 8000), Time(3));
        let packet = encode_accept(Time(10), 1, accept, 4096, 2).unwrap();
        assert_eq!(packet.len(), 30);
        assert_eq!(packet[4], 0x0A);
        let read = read_accept(&packet).unwrap();
        assert_eq!(read.accept, accept);
        assert_eq!(read.window, 4096);
        assert_eq!(read.acknowledged_session, 2);
    }

    #[test]
    fn secure_accept_opens_with_the_shared_cipher() {
        let key = Key([4; KEY_SIZE]);
        let accept = Accept::new(Connect::new(1280, 0, 0), Time(3));
        let mut cipher = testing::cipher(key);
        let packet =
            encode_secure_accept(Time(10), 1, accept, 513, &Key([1; KEY_SIZE]), 1, cipher.as_mut())
                .unwrap();
        assert_eq!(packet.len(), 78);
        let read = read_secure_accept(&packet).unwrap();
        assert_eq!(read.public_key, Key([1; KEY_SIZE]));
        assert_eq!(read.open(cipher.as_mut()), Some(513));
        let mut other = testing::cipher(Key([5; KEY_SIZE]));
        assert_eq!(read.open(other.as_mut()), None);
    }

    #[test]
    fn reset_layouts() {
        let packet = encode_reset(Time(1), 0xDEADBEEF);
        assert_eq!(packet.len(), 13);
        assert_eq!(read_reset(&packet), Some(0xDEADBEEF));

        let mut cipher = testing::cipher(Key([2; KEY_SIZE]));
        let packet = encode_secure_reset(Time(1), &Key([3; KEY_SIZE]), cipher.as_mut());
        assert_eq!(packet.len(), 61);
        let read = read_secure_reset(&packet).unwrap();
        assert!(read.verify(cipher.as_mut()));
    }

    #[test]
    fn data_round_trips_both_ways() {
        let mut packet = begin_data(Time(9), Some(42), 100, 64);
        packet.extend_from_slice(&[0xAA; 8]);
        seal_data(&mut packet, None);
        let read = read_data(&packet).unwrap();
        assert_eq!((read.session, read.window), (42, 100));
        assert_eq!(read.body, &[0xAA; 8]);

        let mut cipher = testing::cipher(Key([6; KEY_SIZE]));
        let mut packet = begin_data(Time(9), None, 100, 64);
        packet.extend_from_slice(&[0xBB; 8]);
        seal_data(&mut packet, Some((cipher.as_mut(), 7)));
        assert_eq!(packet.len(), 7 + 8 + 24);
        let (header, window, body) = open_secure_data(&mut packet, cipher.as_mut()).unwrap();
        assert_eq!(header.flags, 0x1D);
        assert_eq!(window, 100);
        assert_eq!(body, &[0xBB; 8]);
    }
}
