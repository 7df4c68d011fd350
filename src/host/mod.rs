//! The host: a UDP socket, the peers reachable through it and the worker
//! task that drives them.
//!
//! A [`Host`] is opened on a local address and can both connect to remote
//! hosts and accept their connections, up to [`Settings::capacity`].
//! Everything that happens to its peers is reported through
//! [`Host::poll_event`], which never blocks.
//!
//! ## Example
//! ```rust ignore
//! use carambolas::host::{Host, Settings};
//! use carambolas::host::event::Event;
//! use carambolas::protocol::Delivery;
//!
//! #[async_std::main]
//! async fn main() {
//!     let settings = Settings { capacity: 8, ..Settings::default() };
//!     let mut host = Host::open("0.0.0.0:1313", settings).await.unwrap();
//!
//!     loop {
//!         while let Some(event) = host.poll_event().unwrap() {
//!             match event {
//!                 Event::Connection(peer) => println!("{:?} connected", peer),
//!                 Event::Data(peer, data) => {
//!                     let _ = peer.send(&data.payload.to_vec(), Delivery::Reliable, data.channel);
//!                 }
//!                 Event::Disconnection(peer, reason) => println!("{:?} left: {}", peer, reason),
//!             }
//!         }
//!         async_std::task::sleep(std::time::Duration::from_millis(10)).await;
//!     }
//! }
//! ```
pub(crate) mod dispatch;
pub mod event;
pub mod settings;
pub(crate) mod shared;
pub(crate) mod worker;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

#[cfg(feature = "async_std")]
use async_std::{
    net::UdpSocket,
    task::{self, JoinHandle},
};

#[cfg(feature = "async_tokio")]
use tokio::{
    net::UdpSocket,
    task::{self, JoinHandle},
};

use crate::carambolas_debug;
use crate::error::host::{ConnectError, HostError};
use crate::notify::Notify;
use crate::peer::session::options;
use crate::peer::{Peer, PeerReason, PeerState};
use crate::security::Key;
use crate::util::{to_address_token, Clock};

use self::event::{Event, PeerEvent};
pub use self::settings::{ConnectionTypes, Settings, Stream};
use self::shared::Shared;
use self::worker::Dispatcher;

/// This is a helper enum that allows you to pass in a `SocketAddr` or a `&str` to [`Host::open`].
///
/// This will successfully parse the following:
/// - `SocketAddr::new("127.0.0.1:1313")`
/// - `"127.0.0.1:1313"`
/// - `String::from("localhost:1313")`
pub enum PossiblySocketAddr<'a> {
    SocketAddr(SocketAddr),
    Str(&'a str),
    String(String),
}

impl PossiblySocketAddr<'_> {
    pub fn to_socket_addr(self) -> Option<SocketAddr> {
        let resolve = |addr: &str| match addr.parse::<SocketAddr>() {
            Ok(addr) => Some(addr),
            // try to resolve it as a host name then
            Err(_) => addr.to_socket_addrs().ok()?.next(),
        };
        match self {
            PossiblySocketAddr::SocketAddr(addr) => Some(addr),
            PossiblySocketAddr::Str(addr) => resolve(addr),
            PossiblySocketAddr::String(addr) => resolve(&addr),
        }
    }
}

impl From<&str> for PossiblySocketAddr<'_> {
    fn from(s: &str) -> Self {
        PossiblySocketAddr::String(s.to_string())
    }
}

impl From<String> for PossiblySocketAddr<'_> {
    fn from(s: String) -> Self {
        PossiblySocketAddr::String(s)
    }
}

impl From<SocketAddr> for PossiblySocketAddr<'_> {
    fn from(s: SocketAddr) -> Self {
        PossiblySocketAddr::SocketAddr(s)
    }
}

impl std::fmt::Display for PossiblySocketAddr<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PossiblySocketAddr::SocketAddr(addr) => write!(f, "{}", addr),
            PossiblySocketAddr::Str(addr) => write!(f, "{}", addr),
            PossiblySocketAddr::String(addr) => write!(f, "{}", addr),
        }
    }
}

/// A local endpoint of the protocol.
///
/// Peers created by [`Host::connect`] are tracked from the start. Incoming
/// connections become visible once their [`Event::Connection`] is polled.
/// Peers are forgotten when their [`Event::Disconnection`] is polled.
pub struct Host {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    closer: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
    /// Peers the application knows about.
    peers: HashMap<SocketAddr, Arc<Peer>>,
    closed: bool,
}

impl Host {
    /// Binds a socket to `address` and starts the worker.
    ///
    /// Out of range settings are clamped. With security configured and no
    /// private key given, a random key pair is generated.
    pub async fn open<I: for<'a> Into<PossiblySocketAddr<'a>>>(
        address: I,
        settings: Settings,
    ) -> Result<Self, HostError> {
        let address = match address.into().to_socket_addr() {
            Some(address) => address,
            None => {
                carambolas_debug!("Invalid binding value");
                return Err(HostError::AddrBindErr);
            }
        };
        let socket = match UdpSocket::bind(address).await {
            Ok(socket) => socket,
            Err(_) => return Err(HostError::AddrBindErr),
        };
        let local_addr = socket.local_addr().map_err(|_| HostError::AddrBindErr)?;

        let settings = settings.clamped();
        if let Err(e) = socket.set_ttl(settings.ttl as u32) {
            carambolas_debug!("[{}] Unable to set ttl: {}", to_address_token(local_addr), e);
        }
        carambolas_debug!(true, "Host bound to {}", local_addr);

        let shared = Arc::new(Shared::new(settings, Clock::new()));
        let closer = Arc::new(Notify::new());
        let worker = task::spawn(worker::run(
            Dispatcher::new(shared.clone()),
            Arc::new(socket),
            closer.clone(),
        ));

        Ok(Self {
            shared,
            local_addr,
            closer,
            worker: Some(worker),
            peers: HashMap::new(),
            closed: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// The public key of this host, if it is configured for security.
    pub fn public_key(&self) -> Option<Key> {
        self.shared.public_key().copied()
    }

    /// Number of peers the application knows about.
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn get_peer(&self, endpoint: &SocketAddr) -> Option<&Arc<Peer>> {
        self.peers.get(endpoint)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.peers.values()
    }

    fn check(&self) -> Result<(), HostError> {
        if let Some(kind) = self.shared.fault() {
            return Err(HostError::WorkerFault(kind));
        }
        if self.closed {
            return Err(HostError::Closed);
        }
        Ok(())
    }

    /// Starts an insecure connection to `endpoint`.
    pub fn connect(&mut self, endpoint: SocketAddr) -> Result<Arc<Peer>, ConnectError> {
        self.connect_with(endpoint, 0, None)
    }

    /// Starts a secure connection to `endpoint`, trusting whatever public
    /// key it presents.
    pub fn connect_secure(&mut self, endpoint: SocketAddr) -> Result<Arc<Peer>, ConnectError> {
        self.connect_with(endpoint, options::SECURE, None)
    }

    /// Starts a secure connection to `endpoint`, which must present
    /// `remote_key`.
    pub fn connect_with_key(
        &mut self,
        endpoint: SocketAddr,
        remote_key: Key,
    ) -> Result<Arc<Peer>, ConnectError> {
        self.connect_with(
            endpoint,
            options::SECURE | options::VALIDATE_REMOTE_KEY,
            Some(remote_key),
        )
    }

    fn connect_with(
        &mut self,
        endpoint: SocketAddr,
        session_options: u8,
        remote_key: Option<Key>,
    ) -> Result<Arc<Peer>, ConnectError> {
        self.check()?;
        let peer = self.shared.connect(endpoint, session_options, remote_key)?;
        carambolas_debug!("[{}] Connecting", to_address_token(endpoint));
        self.peers.insert(endpoint, peer.clone());
        Ok(peer)
    }

    /// Returns the next event, or `None` when there is nothing new.
    ///
    /// Fails if the worker stopped on a socket error or the host is closed.
    pub fn poll_event(&mut self) -> Result<Option<Event>, HostError> {
        self.check()?;
        while let Some(peer) = self.shared.next_event_peer() {
            if peer.state() == PeerState::Disconnected {
                continue;
            }
            if peer.is_terminated() {
                self.forget(&peer);
                return Ok(Some(Event::Disconnection(peer, PeerReason::Closed)));
            }
            let event = match peer.dequeue() {
                Some(event) => event,
                None => continue,
            };
            match event {
                PeerEvent::Connection => {
                    // a peer closed while connecting stays closed
                    if peer.state() != PeerState::Connecting {
                        continue;
                    }
                    peer.set_user_state(PeerState::Connected);
                    self.peers.insert(peer.endpoint(), peer.clone());
                    return Ok(Some(Event::Connection(peer)));
                }
                PeerEvent::Disconnection(reason) => {
                    self.forget(&peer);
                    return Ok(Some(Event::Disconnection(peer, reason)));
                }
                PeerEvent::Data(data) => return Ok(Some(Event::Data(peer, data))),
            }
        }
        Ok(None)
    }

    /// Removes a peer from the public table and releases it.
    fn forget(&mut self, peer: &Arc<Peer>) {
        let endpoint = peer.endpoint();
        if matches!(self.peers.get(&endpoint), Some(known) if Arc::ptr_eq(known, peer)) {
            self.peers.remove(&endpoint);
        }
        peer.dispose();
    }

    /// Stops the worker, resetting every connection, and releases all peers.
    ///
    /// The host can not be used afterwards. Closing twice is harmless.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.closer.notify();
        if let Some(worker) = self.worker.take() {
            #[cfg(feature = "async_std")]
            worker.await;
            #[cfg(feature = "async_tokio")]
            let _ = worker.await;
        }
        for peer in self.shared.clear() {
            peer.dispose();
        }
        for (_, peer) in self.peers.drain() {
            peer.dispose();
        }
        carambolas_debug!(true, "Host {} closed", self.local_addr);
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // the worker resets the peers on its own way out
        self.closer.notify();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .field("closed", &self.closed)
            .finish()
    }
}
