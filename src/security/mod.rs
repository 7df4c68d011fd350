//! Interfaces to the cryptographic primitives used by secure sessions.
//!
//! No primitives live in this crate. A host that accepts or initiates secure
//! connections is given a [`Security`] bundle in its settings: a cipher
//! factory producing one AEAD [`Cipher`] per session and a [`Keychain`] able
//! to derive public keys and shared keys.
//!
//! Secure packets are encrypted first and signed afterwards. The MAC covers
//! the associated data (the unencrypted part of the packet) and the
//! ciphertext. The nonce of a packet is its send time together with a 64 bit
//! counter that increments on every secure packet a session sends.
use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::protocol::{KEY_SIZE, MAC_SIZE};

/// A 256 bit key, either private, public or shared.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Key(pub [u8; KEY_SIZE]);

impl Key {
    /// Generates a key from the thread local random number generator.
    pub fn random() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys are never printed in full
        write!(f, "Key({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// A 128 bit message authentication code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mac(pub [u8; MAC_SIZE]);

/// Nonce of a secure packet: the sender's time and the session counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Nonce {
    pub time: u32,
    pub counter: u64,
}

impl Nonce {
    pub fn new(time: u32, counter: u64) -> Self {
        Self { time, counter }
    }

    /// The 96 bit big endian form expected by most AEAD constructions.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&self.time.to_be_bytes());
        bytes[4..].copy_from_slice(&self.counter.to_be_bytes());
        bytes
    }
}

/// An authenticated cipher bound to one shared key.
pub trait Cipher: Send {
    fn encrypt_in_place(&mut self, text: &mut [u8], nonce: &Nonce);

    fn decrypt_in_place(&mut self, text: &mut [u8], nonce: &Nonce);

    /// Computes the MAC of the associated data followed by the ciphertext.
    fn sign(&mut self, aad: &[u8], text: &[u8], nonce: &Nonce) -> Mac;

    fn verify(&mut self, aad: &[u8], text: &[u8], nonce: &Nonce, mac: &Mac) -> bool {
        self.sign(aad, text, nonce) == *mac
    }
}

pub trait CipherFactory: Send + Sync {
    /// Creates a cipher keyed with a shared key.
    fn create(&self, key: &Key) -> Box<dyn Cipher>;
}

pub trait Keychain: Send + Sync {
    fn public_key(&self, private: &Key) -> Key;

    fn shared_key(&self, private: &Key, remote_public: &Key) -> Key;
}

/// Everything a host needs to open secure sessions.
#[derive(Clone)]
pub struct Security {
    pub cipher: Arc<dyn CipherFactory>,
    pub keychain: Arc<dyn Keychain>,
    /// The host private key. A random one is generated when `None`.
    pub private_key: Option<Key>,
}

impl Security {
    pub fn new(cipher: Arc<dyn CipherFactory>, keychain: Arc<dyn Keychain>) -> Self {
        Self {
            cipher,
            keychain,
            private_key: None,
        }
    }

    pub fn with_private_key(mut self, key: Key) -> Self {
        self.private_key = Some(key);
        self
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Security")
            .field("private_key", &self.private_key.map(|_| ".."))
            .finish()
    }
}

/// The key pair of an open host.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Keys {
    pub private: Key,
    pub public: Key,
}

impl Keys {
    pub fn resolve(security: &Security) -> Self {
        let private = security.private_key.unwrap_or_else(Key::random);
        Self {
            private,
            public: security.keychain.public_key(&private),
        }
    }
}
