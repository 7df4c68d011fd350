//! State shared by the host handle, its peers and the worker.
//!
//! Lock order: a peer core first, then the peer event queue, then any of the
//! locks below. None of them is held across an await point.
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::host::ConnectError;
use crate::memory::MemoryPool;
use crate::peer::session::{options, State};
use crate::peer::{Peer, PeerMode};
use crate::security::{Cipher, Key, Keys};
use crate::util::{lock, Clock};

use super::event::PeerEvent;
use super::settings::Settings;

/// Peers known to the worker, including those still being accepted and
/// those disconnected but not yet removed.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    peers: HashMap<SocketAddr, Arc<Peer>>,
    /// Passive peers in `peers`.
    accepted: usize,
}

impl Registry {
    pub fn get(&self, endpoint: &SocketAddr) -> Option<&Arc<Peer>> {
        self.peers.get(endpoint)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn add_or_replace(&mut self, peer: Arc<Peer>) {
        if peer.mode() == PeerMode::Passive {
            self.accepted += 1;
        }
        if let Some(previous) = self.peers.insert(peer.endpoint(), peer) {
            if previous.mode() == PeerMode::Passive {
                self.accepted -= 1;
            }
        }
    }

    /// Removes `peer` unless it was replaced already.
    pub fn remove(&mut self, peer: &Arc<Peer>) {
        let endpoint = peer.endpoint();
        if matches!(self.peers.get(&endpoint), Some(stored) if Arc::ptr_eq(stored, peer)) {
            self.peers.remove(&endpoint);
            if peer.mode() == PeerMode::Passive {
                self.accepted -= 1;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.values().cloned().collect()
    }

    pub fn clear(&mut self) -> Vec<Arc<Peer>> {
        self.accepted = 0;
        self.peers.drain().map(|(_, peer)| peer).collect()
    }
}

pub(crate) struct Shared {
    pub settings: Settings,
    pub clock: Clock,
    pub pool: Arc<MemoryPool>,
    /// Present when the host is configured for secure sessions.
    pub keys: Option<Keys>,
    pub registry: Mutex<Registry>,
    /// Order in which peers produced events.
    events: Mutex<VecDeque<Arc<Peer>>>,
    /// RESET packets waiting to be sent, by endpoint and remote session.
    resets: Mutex<HashMap<(SocketAddr, u32), Vec<u8>>>,
    fault: Mutex<Option<ErrorKind>>,
}

impl Shared {
    pub fn new(settings: Settings, clock: Clock) -> Self {
        let keys = settings.security.as_ref().map(Keys::resolve);
        Self {
            settings,
            clock,
            pool: MemoryPool::new(),
            keys,
            registry: Mutex::new(Registry::default()),
            events: Mutex::new(VecDeque::new()),
            resets: Mutex::new(HashMap::new()),
            fault: Mutex::new(None),
        }
    }

    /// Registers an active peer for `endpoint` and schedules its CONNECT.
    /// Fails if a live peer exists for the endpoint.
    pub fn connect(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        session_options: u8,
        remote_key: Option<Key>,
    ) -> Result<Arc<Peer>, ConnectError> {
        if session_options & options::SECURE != 0 && self.keys.is_none() {
            return Err(ConnectError::SecurityUnavailable);
        }
        let peer = Arc::new(Peer::new(
            self.clone(),
            self.clock.now(),
            endpoint,
            PeerMode::Active,
            session_options,
            remote_key,
        ));
        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.get(&endpoint) {
            if existing.state.get() != State::Disconnected {
                return Err(ConnectError::AlreadyConnected);
            }
        }
        {
            // not shared yet, so the core may be locked under the registry
            let mut core = lock(&peer.core);
            peer.on_connecting(&mut core);
        }
        registry.add_or_replace(peer.clone());
        Ok(peer)
    }

    pub fn add_event(&self, peer: &Arc<Peer>, event: PeerEvent) {
        peer.enqueue(event);
        lock(&self.events).push_back(peer.clone());
    }

    pub fn next_event_peer(&self) -> Option<Arc<Peer>> {
        lock(&self.events).pop_front()
    }

    /// Queues a RESET. A later one for the same remote session replaces it.
    pub fn queue_reset(&self, endpoint: SocketAddr, remote_session: u32, packet: Vec<u8>) {
        lock(&self.resets).insert((endpoint, remote_session), packet);
    }

    pub fn take_resets(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        lock(&self.resets)
            .drain()
            .map(|((endpoint, _), packet)| (endpoint, packet))
            .collect()
    }

    /// A cipher keyed with the shared key of this host and `remote_key`.
    pub fn create_cipher(&self, remote_key: &Key) -> Option<Box<dyn Cipher>> {
        let security = self.settings.security.as_ref()?;
        let keys = self.keys.as_ref()?;
        let shared = security.keychain.shared_key(&keys.private, remote_key);
        Some(security.cipher.create(&shared))
    }

    pub fn public_key(&self) -> Option<&Key> {
        self.keys.as_ref().map(|keys| &keys.public)
    }

    pub fn set_fault(&self, kind: ErrorKind) {
        lock(&self.fault).get_or_insert(kind);
    }

    pub fn fault(&self) -> Option<ErrorKind> {
        *lock(&self.fault)
    }

    pub fn clear(&self) -> Vec<Arc<Peer>> {
        lock(&self.events).clear();
        lock(&self.resets).clear();
        lock(&self.registry).clear()
    }
}
