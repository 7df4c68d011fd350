//! Session identity of a peer.
//!
//! The session numbers are the connect times of both ends. A secure session
//! also holds the remote public key and the cipher keyed with the shared key.
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::packet::seal_data;
use crate::security::{Cipher, Key};

pub(crate) mod options {
    pub const SECURE: u8 = 1;
    pub const VALIDATE_REMOTE_KEY: u8 = 2;
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum State {
    Disconnected = 0,
    Connecting,
    Accepting,
    Connected,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Accepting,
            3 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// An atomic [`State`]. Leaving it for `Disconnected` happens exactly once
/// no matter which thread gets there first.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `Disconnected`. Returns the previous state unless it was
    /// disconnected already.
    pub fn try_disconnect(&self) -> Option<State> {
        match State::from_u8(self.0.swap(State::Disconnected as u8, Ordering::AcqRel)) {
            State::Disconnected => None,
            previous => Some(previous),
        }
    }
}

pub(crate) struct Session {
    pub local: u32,
    pub remote: u32,
    pub options: u8,
    pub remote_key: Option<Key>,
    /// Counter of the last nonce used to send.
    nonce: u64,
    cipher: Option<Box<dyn Cipher>>,
}

impl Session {
    pub fn new(local: u32, options: u8) -> Self {
        Self {
            local,
            remote: 0,
            options,
            remote_key: None,
            nonce: 0,
            cipher: None,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.options & options::SECURE != 0
    }

    pub fn validates_remote_key(&self) -> bool {
        self.options & options::VALIDATE_REMOTE_KEY != 0
    }

    /// Binds the session to a remote key and the cipher keyed for it.
    pub fn secure_with(&mut self, remote_key: Key, cipher: Box<dyn Cipher>) {
        self.remote_key = Some(remote_key);
        self.cipher = Some(cipher);
    }

    pub fn cipher(&mut self) -> Option<&mut (dyn Cipher + 'static)> {
        self.cipher.as_deref_mut()
    }

    /// Increments the nonce counter and returns it.
    pub fn next_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.nonce
    }

    /// Completes a DATA packet: encrypted and signed with the next nonce in a
    /// secure session, checksummed otherwise.
    pub fn seal(&mut self, packet: &mut Vec<u8>) {
        if self.is_secure() {
            let nonce = self.next_nonce();
            if let Some(cipher) = self.cipher.as_deref_mut() {
                seal_data(packet, Some((cipher, nonce)));
                return;
            }
        }
        seal_data(packet, None);
    }

    /// Drops the cipher. The session can no longer seal or open packets.
    pub fn dispose(&mut self) {
        self.cipher = None;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local", &format_args!("{:08X}", self.local))
            .field("remote", &format_args!("{:08X}", self.remote))
            .field("options", &self.options)
            .field("nonce", &self.nonce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{begin_data, open_secure_data, read_data};
    use crate::protocol::Time;
    use crate::security::testing;

    #[test]
    fn disconnect_happens_once() {
        let state = AtomicState::new(State::Accepting);
        assert_eq!(state.try_disconnect(), Some(State::Accepting));
        assert_eq!(state.try_disconnect(), None);
        assert_eq!(state.get(), State::Disconnected);
    }

    #[test]
    fn insecure_sessions_checksum() {
        let mut session = Session::new(7, 0);
        let mut packet = begin_data(Time(1), Some(9), 100, 64);
        packet.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 0]);
        session.seal(&mut packet);
        let data = read_data(&packet).unwrap();
        assert_eq!(data.session, 9);
        assert_eq!(data.window, 100);
    }

    #[test]
    fn secure_sessions_encrypt_with_a_fresh_nonce() {
        let key = Key([5; 32]);
        let mut session = Session::new(7, options::SECURE);
        session.secure_with(key, testing::cipher(key));
        let mut packet = begin_data(Time(1), None, 100, 64);
        packet.extend_from_slice(b"abc");
        session.seal(&mut packet);
        assert_eq!(session.next_nonce(), 2);

        let mut cipher = testing::cipher(key);
        let (_, window, body) = open_secure_data(&mut packet, cipher.as_mut()).unwrap();
        assert_eq!(window, 100);
        assert_eq!(body, b"abc");
    }
}
