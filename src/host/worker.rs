//! The worker: a synchronous protocol engine and the async task driving it.
//!
//! [`Dispatcher`] never touches the socket. Each frame the task asks it for
//! the packets to send, sends them outside of any lock and then feeds it
//! whatever arrives until the frame is over.
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "async_std")]
use async_std::net::UdpSocket;
#[cfg(feature = "async_std")]
use futures::{select, FutureExt};

#[cfg(feature = "async_tokio")]
use tokio::{net::UdpSocket, select};

use crate::carambolas_debug;
use crate::notify::Notify;
use crate::peer::session::State;
use crate::peer::state::ResetMode;
use crate::peer::{PeerReason, PeerState};
use crate::protocol::{Time, IP_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::util::{lock, to_address_token};

use super::shared::Shared;

pub(crate) type Outgoing = Vec<(SocketAddr, Vec<u8>)>;

pub(crate) struct Dispatcher {
    pub shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Largest datagram accepted from the socket.
    pub fn max_packet_size(&self) -> usize {
        (self.shared.settings.mtu as usize).saturating_sub(IP_HEADER_SIZE + UDP_HEADER_SIZE)
    }

    /// Runs one frame of every peer and returns the packets to send.
    ///
    /// Peers found disconnected are removed from the registry. Pending
    /// RESETs go last.
    pub fn update(&self, time: Time) -> Outgoing {
        let settings = &self.shared.settings;
        let peers = lock(&self.shared.registry).snapshot();
        let connected = peers
            .iter()
            .filter(|peer| peer.state.get() == State::Connected)
            .count();
        let upstream = settings.upstream.share(connected);
        let downstream = settings.downstream.share(connected);
        let mut budget = settings.upstream.frame_limit(settings.update_rate);

        let mut outgoing = Vec::new();
        let mut disconnected = Vec::new();
        for peer in peers.iter() {
            let mut core = lock(&peer.core);
            match peer.state.get() {
                State::Disconnected => {}
                State::Connecting | State::Accepting => {
                    if peer.on_update(&mut core, time) && budget > 0 {
                        if let Some(packet) = peer.on_connecting_send(&mut core, time) {
                            budget -= 1;
                            peer.record_sent(packet.len());
                            outgoing.push((peer.endpoint(), packet));
                        }
                    }
                }
                State::Connected => {
                    if peer.on_connected_update(&mut core, time, upstream, downstream) {
                        while budget > 0 {
                            match peer.on_connected_send(&mut core, time) {
                                Some(packet) => {
                                    budget -= 1;
                                    peer.record_sent(packet.len());
                                    outgoing.push((peer.endpoint(), packet));
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            if peer.state.get() == State::Disconnected {
                disconnected.push(peer.clone());
            }
        }

        if !disconnected.is_empty() {
            let mut registry = lock(&self.shared.registry);
            for peer in disconnected.iter() {
                registry.remove(peer);
            }
        }
        for peer in disconnected {
            // nobody will ever poll an event for it
            if peer.state() == PeerState::Disconnected {
                peer.dispose();
            }
        }

        outgoing.extend(self.shared.take_resets());
        outgoing
    }

    /// Resets every live peer and returns the RESETs to send before the
    /// socket goes away.
    pub fn shutdown(&self) -> Outgoing {
        let peers = lock(&self.shared.registry).snapshot();
        for peer in peers.iter() {
            let mut core = lock(&peer.core);
            peer.reset(&mut core, PeerReason::Closed, ResetMode::Active);
        }
        self.shared.take_resets()
    }
}

enum Received {
    Packet(usize, SocketAddr),
    /// The wait elapsed, or the error is not worth stopping for.
    Nothing,
    Closed,
    Fault(ErrorKind),
}

impl From<std::io::Result<(usize, SocketAddr)>> for Received {
    fn from(result: std::io::Result<(usize, SocketAddr)>) -> Self {
        match result {
            Ok((length, origin)) => Received::Packet(length, origin),
            Err(e) => match e.kind() {
                // ICMP port unreachable surfaces here on some platforms
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut => Received::Nothing,
                kind => {
                    carambolas_debug!("[WORKER] Failed to receive: {}", e);
                    Received::Fault(kind)
                }
            },
        }
    }
}

#[cfg(feature = "async_std")]
async fn receive(socket: &UdpSocket, buf: &mut [u8], wait: Duration, closer: &Notify) -> Received {
    select! {
        _ = closer.wait().fuse() => Received::Closed,
        recv = async_std::future::timeout(wait, socket.recv_from(buf)).fuse() => match recv {
            Ok(result) => Received::from(result),
            Err(_) => Received::Nothing,
        }
    }
}

#[cfg(feature = "async_tokio")]
async fn receive(socket: &UdpSocket, buf: &mut [u8], wait: Duration, closer: &Notify) -> Received {
    select! {
        _ = closer.wait() => Received::Closed,
        recv = tokio::time::timeout(wait, socket.recv_from(buf)) => match recv {
            Ok(result) => Received::from(result),
            Err(_) => Received::Nothing,
        }
    }
}

/// Time left in a frame that stopped receiving early because the receive
/// cap was hit. A frame lasts its full duration either way.
fn frame_rest(received: u32, receive_limit: u32, now: Time, deadline: Time) -> Option<Duration> {
    if received < receive_limit || now >= deadline {
        return None;
    }
    Some(Duration::from_millis((deadline - now) as u64))
}

/// Sleeps for `wait` unless `closer` fires first. Returns true if it did.
#[cfg(feature = "async_std")]
async fn pause(wait: Duration, closer: &Notify) -> bool {
    async_std::future::timeout(wait, closer.wait()).await.is_ok()
}

#[cfg(feature = "async_tokio")]
async fn pause(wait: Duration, closer: &Notify) -> bool {
    tokio::time::timeout(wait, closer.wait()).await.is_ok()
}

async fn send_packets(socket: &UdpSocket, packets: Outgoing) {
    for (endpoint, packet) in packets {
        if let Err(e) = socket.send_to(&packet[..], endpoint).await {
            // the peer will time out if this keeps happening
            carambolas_debug!(
                true,
                "[{}] Failed to send packet: {}",
                to_address_token(endpoint),
                e
            );
        }
    }
}

/// The worker task. Returns once `closer` is notified or the socket fails.
pub(crate) async fn run(dispatcher: Dispatcher, socket: Arc<UdpSocket>, closer: Arc<Notify>) {
    let shared = dispatcher.shared.clone();
    let frame = shared.settings.frame_duration();
    let receive_limit = shared
        .settings
        .downstream
        .frame_limit(shared.settings.update_rate);
    let max_packet = dispatcher.max_packet_size();
    // one extra byte tells oversized datagrams apart
    let mut buf = vec![0u8; max_packet + 1];

    'frames: while !closer.is_notified() {
        let start = shared.clock.now();
        send_packets(&socket, dispatcher.update(start)).await;

        let deadline = start + frame;
        let mut received = 0;
        while received < receive_limit {
            let now = shared.clock.now();
            if now >= deadline {
                break;
            }
            let wait = Duration::from_millis((deadline - now) as u64);
            match receive(&socket, &mut buf, wait, &closer).await {
                Received::Packet(length, origin) => {
                    received += 1;
                    if length > max_packet {
                        continue;
                    }
                    dispatcher.on_packet(shared.clock.now(), origin, &mut buf[..length]);
                }
                Received::Nothing => {}
                Received::Closed => break 'frames,
                Received::Fault(kind) => {
                    shared.set_fault(kind);
                    carambolas_debug!("[WORKER] Stopped: {:?}", kind);
                    return;
                }
            }
        }

        if let Some(wait) = frame_rest(received, receive_limit, shared.clock.now(), deadline) {
            if pause(wait, &closer).await {
                break;
            }
        }
    }

    carambolas_debug!(true, "[WORKER] Received the shutdown notification");
    send_packets(&socket, dispatcher.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::event::PeerEvent;
    use crate::host::settings::{Settings, Stream};
    use crate::peer::session::options;
    use crate::peer::{Peer, PeerMode};
    use crate::protocol::packet::handshake::Connect;
    use crate::protocol::packet::{begin_data, encode_connect, read_reset, seal_data};
    use crate::protocol::{bandwidth, Delivery};
    use crate::security::{testing, Key};
    use crate::util::Clock;

    const START: u32 = 50_000;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn dispatcher(settings: Settings) -> Dispatcher {
        Dispatcher::new(Arc::new(Shared::new(settings, Clock::starting_at(START))))
    }

    fn accepting() -> Settings {
        Settings {
            capacity: 1,
            ..Settings::default()
        }
    }

    /// Two dispatchers exchanging packets over a perfect (or lossy) wire.
    struct Net {
        a: Dispatcher,
        b: Dispatcher,
        time: Time,
        drop_a_to_b: bool,
    }

    impl Net {
        fn new(a: Settings, b: Settings) -> Self {
            Self {
                a: dispatcher(a),
                b: dispatcher(b),
                time: Time(START),
                drop_a_to_b: false,
            }
        }

        fn round(&mut self) {
            let time = self.time;
            let from_a = self.a.update(time);
            let from_b = self.b.update(time);
            for (to, mut packet) in from_a {
                if to == addr(2) && !self.drop_a_to_b {
                    self.b.on_packet(time, addr(1), &mut packet);
                }
            }
            for (to, mut packet) in from_b {
                if to == addr(1) {
                    self.a.on_packet(time, addr(2), &mut packet);
                }
            }
            self.time = time + 20;
        }

        fn rounds(&mut self, count: usize) {
            for _ in 0..count {
                self.round();
            }
        }
    }

    /// Drains the events of a dispatcher the way the host does, marking
    /// connected peers.
    fn events(dispatcher: &Dispatcher) -> Vec<(Arc<Peer>, PeerEvent)> {
        let mut events = Vec::new();
        while let Some(peer) = dispatcher.shared.next_event_peer() {
            if let Some(event) = peer.dequeue() {
                if let PeerEvent::Connection = event {
                    peer.set_user_state(PeerState::Connected);
                }
                events.push((peer, event));
            }
        }
        events
    }

    fn connected_pair(a: Settings, b: Settings, session_options: u8) -> (Net, Arc<Peer>, Arc<Peer>) {
        let mut net = Net::new(a, b);
        let active = net.a.shared.connect(addr(2), session_options, None).unwrap();
        net.rounds(3);
        assert!(matches!(events(&net.a)[..], [(_, PeerEvent::Connection)]));
        let passive = match events(&net.b).pop() {
            Some((peer, PeerEvent::Connection)) => peer,
            other => panic!("unexpected event {:?}", other),
        };
        (net, active, passive)
    }

    #[test]
    fn handshake_connects_both_sides() {
        let (net, active, passive) = connected_pair(Settings::default(), accepting(), 0);
        assert_eq!(active.state.get(), State::Connected);
        assert_eq!(passive.state.get(), State::Connected);
        assert_eq!(passive.endpoint(), addr(1));
        assert_eq!(passive.mode(), PeerMode::Passive);
        assert_eq!(lock(&net.b.shared.registry).accepted(), 1);
        assert_eq!(active.mtu(), 1280);
    }

    #[test]
    fn datagrams_are_delivered_and_acknowledged() {
        let (mut net, active, _) = connected_pair(Settings::default(), accepting(), 0);
        active.send(b"hello", Delivery::Reliable, 0).unwrap();
        active.send(b"world", Delivery::Unreliable, 0).unwrap();
        net.rounds(2);

        let received: Vec<Vec<u8>> = events(&net.b)
            .into_iter()
            .filter_map(|(_, event)| match event {
                PeerEvent::Data(data) => Some(data.payload.to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(active.backlog(), 0);
        assert_eq!(lock(&active.core).flow.bytes_in_flight, 0);
    }

    #[test]
    fn large_datagrams_are_fragmented_and_reassembled() {
        let (mut net, active, _) = connected_pair(Settings::default(), accepting(), 0);
        let payload: Vec<u8> = (0..3000).map(|i| i as u8).collect();
        active.send(&payload, Delivery::Reliable, 0).unwrap();
        net.rounds(4);

        match &events(&net.b)[..] {
            [(_, PeerEvent::Data(data))] => assert_eq!(data.payload.to_vec(), payload),
            other => panic!("unexpected events {:?}", other),
        }
        assert!(active.stats().packets_sent >= 3);
    }

    #[test]
    fn crossed_connection_requests_meet_halfway() {
        let mut net = Net::new(accepting(), accepting());
        let a = net.a.shared.connect(addr(2), 0, None).unwrap();
        let b = net.b.shared.connect(addr(1), 0, None).unwrap();
        net.rounds(3);
        assert_eq!(a.state.get(), State::Connected);
        assert_eq!(b.state.get(), State::Connected);
        assert!(matches!(events(&net.a)[..], [(_, PeerEvent::Connection)]));
        assert!(matches!(events(&net.b)[..], [(_, PeerEvent::Connection)]));
    }

    #[test]
    fn data_for_an_unknown_session_is_reset() {
        let dispatcher = dispatcher(Settings::default());
        let mut packet = begin_data(Time(5), Some(99), 100, 64);
        packet.push(0);
        seal_data(&mut packet, None);
        dispatcher.on_packet(Time(START), addr(1), &mut packet);

        let outgoing = dispatcher.update(Time(START));
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].0, addr(1));
        assert_eq!(read_reset(&outgoing[0].1), Some(99));
    }

    #[test]
    fn reconnect_over_a_half_open_session_sends_no_reset() {
        let (net, _, passive) = connected_pair(Settings::default(), accepting(), 0);
        let link = Connect::new(1280, 0, bandwidth::MAX);
        let mut packet = encode_connect(net.time + 10_000, 999, link, None).unwrap();
        net.b.on_packet(net.time, addr(1), &mut packet);

        assert_eq!(passive.state.get(), State::Disconnected);
        assert!(matches!(
            events(&net.b)[..],
            [(_, PeerEvent::Disconnection(PeerReason::Error))]
        ));
        assert!(net.b.shared.take_resets().is_empty());

        let registry = lock(&net.b.shared.registry);
        let replacement = registry.get(&addr(1)).unwrap();
        assert!(!Arc::ptr_eq(replacement, &passive));
        assert_eq!(replacement.state.get(), State::Accepting);
    }

    #[test]
    fn corrupted_connect_is_ignored() {
        let dispatcher = dispatcher(accepting());
        let link = Connect::new(1280, 0, bandwidth::MAX);
        let mut packet = encode_connect(Time(5), 42, link, None).unwrap();
        packet[6] ^= 0xFF;
        dispatcher.on_packet(Time(START), addr(1), &mut packet);
        assert_eq!(lock(&dispatcher.shared.registry).len(), 0);

        packet[6] ^= 0xFF;
        dispatcher.on_packet(Time(START), addr(1), &mut packet);
        assert_eq!(lock(&dispatcher.shared.registry).len(), 1);
    }

    #[test]
    fn connections_beyond_capacity_are_refused() {
        let dispatcher = dispatcher(Settings::default());
        let link = Connect::new(1280, 0, bandwidth::MAX);
        let mut packet = encode_connect(Time(5), 42, link, None).unwrap();
        dispatcher.on_packet(Time(START), addr(1), &mut packet);
        assert_eq!(lock(&dispatcher.shared.registry).len(), 0);
        assert!(dispatcher.update(Time(START)).is_empty());
    }

    #[test]
    fn unanswered_connect_is_unreachable() {
        let settings = Settings {
            connection_timeout: 1000,
            ..Settings::default()
        };
        let mut net = Net::new(settings, Settings::default());
        let peer = net.a.shared.connect(addr(2), 0, None).unwrap();
        net.rounds(60);
        assert_eq!(peer.state.get(), State::Disconnected);
        assert!(matches!(
            events(&net.a)[..],
            [(_, PeerEvent::Disconnection(PeerReason::Unreachable))]
        ));
        assert_eq!(lock(&net.a.shared.registry).len(), 0);
    }

    #[test]
    fn ack_failures_while_connecting_are_unreachable() {
        // the ack fail limit trips well before the connection timeout
        let mut net = Net::new(Settings::default(), Settings::default());
        net.drop_a_to_b = true;
        let peer = net.a.shared.connect(addr(2), 0, None).unwrap();
        let mut elapsed = 0;
        while peer.state.get() != State::Disconnected && elapsed < 40_000 {
            net.round();
            elapsed += 20;
        }
        assert!(elapsed < Settings::default().connection_timeout);
        assert!(matches!(
            events(&net.a)[..],
            [(_, PeerEvent::Disconnection(PeerReason::Unreachable))]
        ));
    }

    #[test]
    fn ack_failures_after_connecting_time_out() {
        let (mut net, active, _) = connected_pair(Settings::default(), accepting(), 0);
        net.drop_a_to_b = true;
        active.send(b"lost", Delivery::Reliable, 0).unwrap();
        for _ in 0..3000 {
            if active.state.get() == State::Disconnected {
                break;
            }
            net.round();
        }
        assert!(matches!(
            events(&net.a)[..],
            [(_, PeerEvent::Disconnection(PeerReason::TimedOut))]
        ));
    }

    #[test]
    fn connect_requests_are_charged_to_the_frame_budget() {
        let settings = Settings {
            upstream: Stream {
                packet_rate: Settings::default().update_rate,
                ..Stream::default()
            },
            ..Settings::default()
        };
        assert_eq!(settings.upstream.frame_limit(settings.update_rate), 1);
        let dispatcher = dispatcher(settings);
        dispatcher.shared.connect(addr(2), 0, None).unwrap();
        dispatcher.shared.connect(addr(3), 0, None).unwrap();

        let first = dispatcher.update(Time(START));
        assert_eq!(first.len(), 1);
        let second = dispatcher.update(Time(START + 20));
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].0, second[0].0);
    }

    #[test]
    fn frames_capped_on_receive_last_their_full_duration() {
        let deadline = Time(START + 20);
        assert_eq!(
            frame_rest(4, 4, Time(START + 5), deadline),
            Some(Duration::from_millis(15))
        );
        assert_eq!(frame_rest(3, 4, Time(START + 5), deadline), None);
        assert_eq!(frame_rest(4, 4, deadline, deadline), None);
        assert_eq!(frame_rest(4, 4, Time(START + 25), deadline), None);
    }

    #[test]
    fn two_ack_timeouts_reset_the_estimates() {
        let (mut net, active, _) = connected_pair(Settings::default(), accepting(), 0);
        net.drop_a_to_b = true;
        active.send(b"lost", Delivery::Reliable, 0).unwrap();
        for _ in 0..100 {
            if active.stats().timeouts >= 2 {
                break;
            }
            net.round();
        }
        assert_eq!(active.stats().timeouts, 2);
        let core = lock(&active.core);
        assert_eq!(core.flow.round_trip_time, 0);
        assert_eq!(core.flow.congestion_window, core.flow.max_segment_size);
        assert!(core.flow.ack_timeout > 200);
    }

    #[test]
    fn closing_resets_the_remote_peer() {
        let (mut net, active, passive) = connected_pair(Settings::default(), accepting(), 0);
        active.close(false);
        net.round();
        assert!(matches!(
            events(&net.a)[..],
            [(_, PeerEvent::Disconnection(PeerReason::Closed))]
        ));
        assert!(matches!(
            events(&net.b)[..],
            [(_, PeerEvent::Disconnection(PeerReason::Reset))]
        ));
        assert_eq!(passive.state.get(), State::Disconnected);
        assert_eq!(lock(&net.a.shared.registry).len(), 0);
    }

    fn secure(seed: u8) -> Settings {
        Settings {
            capacity: 1,
            security: Some(testing::security(seed)),
            ..Settings::default()
        }
    }

    #[test]
    fn secure_sessions_exchange_data() {
        let (mut net, active, passive) = connected_pair(secure(1), secure(2), options::SECURE);
        assert!(active.is_secure());
        assert!(passive.is_secure());
        active.send(b"secret", Delivery::Reliable, 0).unwrap();
        net.rounds(2);
        match &events(&net.b)[..] {
            [(_, PeerEvent::Data(data))] => assert_eq!(data.payload.to_vec(), b"secret"),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(active.backlog(), 0);
    }

    #[test]
    fn secure_accept_with_an_unexpected_key_is_dropped() {
        let mut net = Net::new(secure(1), secure(2));
        let peer = net
            .a
            .shared
            .connect(
                addr(2),
                options::SECURE | options::VALIDATE_REMOTE_KEY,
                Some(Key([9; 32])),
            )
            .unwrap();
        net.rounds(3);
        assert_eq!(peer.state.get(), State::Connecting);
        assert!(peer.stats().packets_dropped >= 1);
        assert!(events(&net.a).is_empty());
    }

    #[test]
    fn secure_connect_requires_security() {
        let dispatcher = dispatcher(Settings::default());
        assert_eq!(
            dispatcher
                .shared
                .connect(addr(2), options::SECURE, None)
                .unwrap_err(),
            crate::error::ConnectError::SecurityUnavailable
        );
    }

    #[test]
    fn live_peers_are_not_replaced_by_connect() {
        let dispatcher = dispatcher(Settings::default());
        dispatcher.shared.connect(addr(2), 0, None).unwrap();
        assert_eq!(
            dispatcher.shared.connect(addr(2), 0, None).unwrap_err(),
            crate::error::ConnectError::AlreadyConnected
        );
    }
}
