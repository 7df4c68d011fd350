//! Peers: one per remote endpoint.
//!
//! A [`Peer`] is shared between the application and the worker. The
//! application only touches the staging area, the event queue and a handful
//! of atomics. Everything else lives in [`PeerCore`](core::PeerCore), which
//! the worker locks while it updates, sends or receives for the peer.
pub(crate) mod controller;
pub(crate) mod core;
pub(crate) mod receive;
pub(crate) mod session;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;
pub(crate) mod transmit;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::outbound::OutboundMessage;
use crate::channel::staging::Staging;
use crate::error::peer::SendError;
use crate::host::event::PeerEvent;
use crate::host::shared::Shared;
use crate::protocol::packet::{encode_reset, encode_secure_reset};
use crate::protocol::{datagram, max_fragment_size, max_segment_size, mtu, Delivery, QoS, Time};
use crate::security::Key;
use crate::util::lock;

use self::core::PeerCore;
use self::session::{options, AtomicState, Session, State};
use self::state::AtomicPeerState;
pub use self::state::{PeerMode, PeerReason, PeerState};

/// Traffic counters of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Packets received but discarded: undecodable, out of place or expired.
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// User payload bytes transmitted for the first time.
    pub data_sent: u64,
    /// User payload bytes received for the first time.
    pub data_received: u64,
    pub fast_retransmissions: u64,
    pub timeouts: u64,
}

impl PeerStats {
    /// Estimated fraction of packets lost.
    pub fn loss(&self) -> f64 {
        match self.packets_sent {
            0 => 0.0,
            sent => ((self.fast_retransmissions + self.timeouts) as f64 / sent as f64).min(1.0),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub data_sent: AtomicU64,
    pub data_received: AtomicU64,
    pub fast_retransmissions: AtomicU64,
    pub timeouts: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PeerStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PeerStats {
            packets_sent: read(&self.packets_sent),
            packets_received: read(&self.packets_received),
            packets_dropped: read(&self.packets_dropped),
            bytes_sent: read(&self.bytes_sent),
            bytes_received: read(&self.bytes_received),
            data_sent: read(&self.data_sent),
            data_received: read(&self.data_received),
            fast_retransmissions: read(&self.fast_retransmissions),
            timeouts: read(&self.timeouts),
        }
    }
}

/// A connection to a remote host.
///
/// Peers are handed out by [`Host::connect`](crate::host::Host::connect)
/// and by [`Event`](crate::host::event::Event)s. Sending and closing never
/// block: data is staged and picked up by the worker on its next frame.
pub struct Peer {
    pub(crate) shared: Arc<Shared>,
    endpoint: SocketAddr,
    mode: PeerMode,
    secure: bool,
    pub(crate) state: AtomicState,
    user_state: AtomicPeerState,
    /// Set by a forced close. Pending events are skipped.
    terminated: AtomicBool,
    /// Bytes sent by the application and not yet acknowledged or dropped.
    /// Only the application adds and only the worker subtracts, so a stale
    /// read at worst rejects a send that would have fit.
    backlog: AtomicUsize,
    max_backlog: usize,
    mtu: AtomicU16,
    max_channel: AtomicU8,
    pub(crate) counters: Counters,
    staging: Mutex<Staging>,
    events: Mutex<VecDeque<PeerEvent>>,
    pub(crate) core: Mutex<PeerCore>,
}

impl Peer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        time: Time,
        endpoint: SocketAddr,
        mode: PeerMode,
        options: u8,
        remote_key: Option<Key>,
    ) -> Self {
        let mut session = Session::new(time.0, options);
        if let (true, Some(key)) = (session.validates_remote_key(), remote_key) {
            match shared.create_cipher(&key) {
                Some(cipher) => session.secure_with(key, cipher),
                None => session.remote_key = Some(key),
            }
        }
        let core = PeerCore::new(session, mtu::MIN, shared.settings.ack_timeouts());
        Self {
            endpoint,
            mode,
            secure: options & options::SECURE != 0,
            state: AtomicState::new(State::Disconnected),
            user_state: AtomicPeerState::new(PeerState::Connecting),
            terminated: AtomicBool::new(false),
            backlog: AtomicUsize::new(0),
            max_backlog: shared.settings.max_backlog,
            mtu: AtomicU16::new(mtu::MIN),
            max_channel: AtomicU8::new(0),
            counters: Counters::default(),
            staging: Mutex::new(Staging::new()),
            events: Mutex::new(VecDeque::new()),
            core: Mutex::new(core),
            shared,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// State of the peer as seen by the application.
    pub fn state(&self) -> PeerState {
        self.user_state.get()
    }

    /// Negotiated maximum transmission unit.
    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn max_segment_size(&self) -> u16 {
        max_segment_size(self.mtu(), self.secure)
    }

    pub fn max_fragment_size(&self) -> u16 {
        max_fragment_size(self.mtu(), self.secure)
    }

    /// Highest channel usable with this peer.
    pub fn max_channel(&self) -> u8 {
        self.max_channel.load(Ordering::Acquire)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }

    pub fn stats(&self) -> PeerStats {
        self.counters.snapshot()
    }

    /// Smoothed round trip time in milliseconds, zero while unknown.
    pub fn round_trip_time(&self) -> u32 {
        lock(&self.core).flow.round_trip_time
    }

    /// Queues `data` for delivery on `channel`.
    pub fn send(&self, data: &[u8], delivery: Delivery, channel: u8) -> Result<(), SendError> {
        self.send_with(data, QoS::new(delivery), channel)
    }

    /// Queues `data` for delivery on `channel` with a time limit.
    ///
    /// Datagrams larger than the max segment size are split in fragments.
    /// An empty datagram is accepted and ignored.
    pub fn send_with(&self, data: &[u8], qos: QoS, channel: u8) -> Result<(), SendError> {
        if self.state() != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if channel > self.max_channel() {
            return Err(SendError::InvalidChannel);
        }
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > datagram::MAX {
            return Err(SendError::InvalidLength);
        }
        if self.max_backlog.saturating_sub(self.backlog()) < data.len() {
            return Err(SendError::BacklogExceeded);
        }
        self.backlog.fetch_add(data.len(), Ordering::Relaxed);

        let expiration = self.shared.clock.now() + qos.expiration_offset();
        let messages = OutboundMessage::split(
            &self.shared.pool,
            channel,
            qos.delivery,
            expiration,
            data,
            self.max_segment_size(),
            self.max_fragment_size(),
        );
        lock(&self.staging).push(channel, messages);
        Ok(())
    }

    /// Disconnects from the remote host.
    ///
    /// A forced close discards pending events so the next one polled for
    /// this peer is its disconnection. Otherwise pending events are
    /// delivered first. Calling it again is harmless.
    pub fn close(self: &Arc<Self>, force: bool) {
        if let Some(previous) = self.state.try_disconnect() {
            if previous != State::Connecting {
                let mut core = lock(&self.core);
                self.queue_reset(&mut core);
            }
        }
        let state = self.state();
        if state != PeerState::Disconnected && state != PeerState::Disconnecting {
            self.user_state.set(PeerState::Disconnecting);
            self.shared
                .add_event(self, PeerEvent::Disconnection(PeerReason::Closed));
        }
        self.terminated.store(force, Ordering::Release);
    }

    /// Queues a RESET for the remote session.
    pub(crate) fn queue_reset(&self, core: &mut PeerCore) {
        let time = self.shared.clock.now();
        let remote = core.session.remote;
        let public_key = self.shared.public_key().copied();
        let packet = match (core.session.is_secure(), public_key, core.session.cipher()) {
            (true, Some(key), Some(cipher)) => encode_secure_reset(time, &key, cipher),
            _ => encode_reset(time, remote),
        };
        self.shared.queue_reset(self.endpoint, remote, packet);
    }

    pub(crate) fn set_user_state(&self, state: PeerState) {
        self.user_state.set(state);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn set_link(&self, mtu: u16, max_channel: u8) {
        self.mtu.store(mtu, Ordering::Release);
        self.max_channel.store(max_channel, Ordering::Release);
    }

    /// Returns bytes to the backlog.
    pub(crate) fn release_backlog(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .backlog
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |backlog| {
                Some(backlog.saturating_sub(bytes))
            });
    }

    /// Accounts a ping added by the worker.
    pub(crate) fn reserve_backlog(&self, bytes: usize) {
        self.backlog.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn take_staged(&self) -> Vec<(u8, Vec<OutboundMessage>)> {
        lock(&self.staging).drain()
    }

    pub(crate) fn enqueue(&self, event: PeerEvent) {
        lock(&self.events).push_back(event);
    }

    pub(crate) fn dequeue(&self) -> Option<PeerEvent> {
        lock(&self.events).pop_front()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        Counters::add(&self.counters.packets_sent, 1);
        Counters::add(&self.counters.bytes_sent, bytes);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        Counters::add(&self.counters.packets_received, 1);
        Counters::add(&self.counters.bytes_received, bytes);
    }

    pub(crate) fn record_dropped(&self) {
        Counters::add(&self.counters.packets_dropped, 1);
    }

    /// Releases everything the peer holds. The peer stays usable as a
    /// handle but is permanently disconnected.
    pub(crate) fn dispose(&self) {
        self.state.set(State::Disconnected);
        lock(&self.core).dispose();
        lock(&self.staging).clear();
        lock(&self.events).clear();
        self.user_state.set(PeerState::Disconnected);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("secure", &self.secure)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::settings::Settings;
    use crate::util::Clock;

    fn peer() -> Arc<Peer> {
        let shared = Arc::new(Shared::new(Settings::default(), Clock::starting_at(1000)));
        let endpoint = "127.0.0.1:1000".parse().unwrap();
        Arc::new(Peer::new(shared, Time(1000), endpoint, PeerMode::Active, 0, None))
    }

    #[test]
    fn send_requires_a_connection() {
        let peer = peer();
        assert_eq!(
            peer.send(b"hello", Delivery::Reliable, 0),
            Err(SendError::NotConnected)
        );
    }

    #[test]
    fn send_validates_its_arguments() {
        let peer = peer();
        peer.set_user_state(PeerState::Connected);
        peer.set_link(1280, 1);
        assert_eq!(peer.send(b"x", Delivery::Reliable, 2), Err(SendError::InvalidChannel));
        assert_eq!(peer.send(b"", Delivery::Reliable, 0), Ok(()));
        assert_eq!(peer.backlog(), 0);
        let large = vec![0u8; datagram::MAX + 1];
        assert_eq!(peer.send(&large, Delivery::Reliable, 0), Err(SendError::InvalidLength));

        assert_eq!(peer.send(b"hello", Delivery::Reliable, 1), Ok(()));
        assert_eq!(peer.backlog(), 5);
        let staged = peer.take_staged();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].0, 1);
    }

    #[test]
    fn backlog_is_bounded() {
        let shared = Arc::new(Shared::new(
            Settings {
                max_backlog: 8,
                ..Settings::default()
            },
            Clock::starting_at(0),
        ));
        let endpoint = "127.0.0.1:1000".parse().unwrap();
        let peer = Peer::new(shared, Time(0), endpoint, PeerMode::Active, 0, None);
        peer.set_user_state(PeerState::Connected);
        assert_eq!(peer.send(b"12345", Delivery::Unreliable, 0), Ok(()));
        assert_eq!(
            peer.send(b"12345", Delivery::Unreliable, 0),
            Err(SendError::BacklogExceeded)
        );
        peer.release_backlog(100);
        assert_eq!(peer.backlog(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let peer = peer();
        peer.close(false);
        assert_eq!(peer.state(), PeerState::Disconnecting);
        peer.close(true);
        assert!(peer.is_terminated());
        assert!(matches!(
            peer.dequeue(),
            Some(PeerEvent::Disconnection(PeerReason::Closed))
        ));
        assert!(peer.dequeue().is_none());
        assert_eq!(peer.shared.next_event_peer().map(|p| p.endpoint()), Some(peer.endpoint()));
        assert!(peer.shared.next_event_peer().is_none());
    }

    #[test]
    fn loss_is_a_fraction_of_packets_sent() {
        let stats = PeerStats {
            packets_sent: 10,
            fast_retransmissions: 1,
            timeouts: 1,
            ..PeerStats::default()
        };
        assert!((stats.loss() - 0.2).abs() < 1e-9);
        assert_eq!(PeerStats::default().loss(), 0.0);
    }
}
