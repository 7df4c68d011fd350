//! Incoming packet dispatch.
//!
//! Every packet is checked for its exact length and its checksum or MAC
//! before it may change any state. Anything that does not fit the grammar
//! is silently ignored; packets from a known peer that fail a later check
//! are counted as dropped.
use std::net::SocketAddr;
use std::sync::Arc;

use crate::carambolas_debug;
use crate::peer::core::PeerCore;
use crate::peer::session::{options, State};
use crate::peer::state::ResetMode;
use crate::peer::{Peer, PeerMode, PeerReason};
use crate::protocol::packet::handshake::{Accept, Connect};
use crate::protocol::packet::{
    encode_reset, open_secure_data, read_accept, read_connect, read_data, read_reset,
    read_secure_accept, read_secure_reset, ConnectPacket, Header,
};
use crate::protocol::{bandwidth, packet_flags, Time, PACKET_LIFETIME};
use crate::security::Key;
use crate::util::{lock, to_address_token};

use super::settings::ConnectionTypes;
use super::worker::Dispatcher;

/// Outcome of offering a CONNECT to the registry.
enum Acceptance {
    /// A passive peer was created, or the request was refused.
    Handled,
    /// A live peer already exists for the endpoint.
    Existing(Arc<Peer>),
}

/// Attempts at accepting a CONNECT. The second one follows the reset of a
/// half-open connection.
const ACCEPT_ATTEMPTS: usize = 2;

fn reset_reason(state: State) -> PeerReason {
    match state {
        State::Connected => PeerReason::Reset,
        _ => PeerReason::Refused,
    }
}

impl Dispatcher {
    /// Handles one datagram received from `endpoint` at `time`.
    pub(crate) fn on_packet(&self, time: Time, endpoint: SocketAddr, packet: &mut [u8]) {
        let header = match Header::parse(packet) {
            Some(header) => header,
            None => return,
        };
        match header.flags {
            packet_flags::CONNECT => self.on_connect(time, endpoint, packet),
            flags if flags == packet_flags::SECURE | packet_flags::CONNECT => {
                self.on_connect(time, endpoint, packet)
            }
            packet_flags::ACCEPT => self.on_accept(time, endpoint, packet),
            flags if flags == packet_flags::SECURE | packet_flags::ACCEPT => {
                self.on_secure_accept(time, endpoint, packet)
            }
            packet_flags::DATA => self.on_data(time, endpoint, packet),
            flags if flags == packet_flags::SECURE | packet_flags::DATA => {
                self.on_secure_data(time, endpoint, packet)
            }
            packet_flags::RESET => self.on_reset(endpoint, packet),
            flags if flags == packet_flags::SECURE | packet_flags::RESET => {
                self.on_secure_reset(endpoint, packet)
            }
            flags => {
                carambolas_debug!(
                    true,
                    "[{}] Ignored packet with flags {:#04x}",
                    to_address_token(endpoint),
                    flags
                );
            }
        }
    }

    fn find(&self, endpoint: &SocketAddr) -> Option<Arc<Peer>> {
        lock(&self.shared.registry).get(endpoint).cloned()
    }

    /// Creates a passive peer for a CONNECT unless a live one exists.
    fn try_accept(
        &self,
        time: Time,
        endpoint: SocketAddr,
        connect: &ConnectPacket,
        link: Connect,
    ) -> Acceptance {
        let settings = &self.shared.settings;
        let mut registry = lock(&self.shared.registry);
        let mut accepted = registry.accepted();
        if let Some(peer) = registry.get(&endpoint) {
            if peer.state.get() != State::Disconnected {
                return Acceptance::Existing(peer.clone());
            }
            if peer.mode() == PeerMode::Passive {
                accepted -= 1;
            }
        }

        let (kind, session_options) = match connect.public_key {
            Some(_) => (
                ConnectionTypes::SECURE,
                options::SECURE | options::VALIDATE_REMOTE_KEY,
            ),
            None => (ConnectionTypes::INSECURE, 0),
        };
        let secure_ready = connect.public_key.is_none() || self.shared.keys.is_some();
        if !settings.connection_types.contains(kind) || !secure_ready || accepted >= settings.capacity {
            carambolas_debug!(
                "[{}] Refused connection ({} of {} accepted)",
                to_address_token(endpoint),
                accepted,
                settings.capacity
            );
            return Acceptance::Handled;
        }

        let peer = Arc::new(Peer::new(
            self.shared.clone(),
            time,
            endpoint,
            PeerMode::Passive,
            session_options,
            connect.public_key,
        ));
        {
            // not shared yet, so the core may be locked under the registry
            let mut core = lock(&peer.core);
            if core.session.is_secure() && core.session.cipher().is_none() {
                return Acceptance::Handled;
            }
            peer.on_accepting(&mut core, connect.header.time, connect.session, link);
        }
        carambolas_debug!(
            "[{}] Accepting connection (mtu {}, max channel {})",
            to_address_token(endpoint),
            link.mtu,
            link.mtc
        );
        registry.add_or_replace(peer);
        Acceptance::Handled
    }

    fn on_connect(&self, time: Time, endpoint: SocketAddr, packet: &[u8]) {
        let connect = match read_connect(packet) {
            Some(connect) => connect,
            None => return,
        };
        let settings = &self.shared.settings;
        let link = match connect.link.negotiate(settings.mtu, settings.max_channel) {
            Some(link) => link,
            None => return,
        };

        for _ in 0..ACCEPT_ATTEMPTS {
            let peer = match self.try_accept(time, endpoint, &connect, link) {
                Acceptance::Existing(peer) => peer,
                Acceptance::Handled => return,
            };
            let mut core = lock(&peer.core);
            let retry = match connect.public_key {
                None => self.on_existing_connect(&peer, &mut core, packet.len(), &connect, link),
                Some(key) => {
                    self.on_existing_secure_connect(&peer, &mut core, packet.len(), &connect, link, key)
                }
            };
            if !retry {
                return;
            }
        }
    }

    /// A CONNECT from a known endpoint. Returns true when the existing peer
    /// was reset and the request should be accepted afresh.
    fn on_existing_connect(
        &self,
        peer: &Arc<Peer>,
        core: &mut PeerCore,
        length: usize,
        connect: &ConnectPacket,
        link: Connect,
    ) -> bool {
        // insecure packets other than CONNECT are ignored by secure sessions
        if core.session.is_secure() {
            return false;
        }
        peer.record_received(length);
        let remote_time = connect.header.time;

        match peer.state.get() {
            State::Disconnected => true,
            State::Connecting => {
                core.latest_remote_time = remote_time;
                peer.on_cross_connecting(core, remote_time, connect.session, link, None);
                false
            }
            state if core.latest_remote_time < remote_time => {
                if core.session.remote == connect.session {
                    core.latest_remote_time = remote_time;
                    if state == State::Accepting {
                        peer.accept(core, remote_time);
                    }
                    false
                } else {
                    // the remote host restarted: drop the half-open session
                    peer.reset(core, PeerReason::Error, ResetMode::Passive);
                    true
                }
            }
            _ => false,
        }
    }

    fn on_existing_secure_connect(
        &self,
        peer: &Arc<Peer>,
        core: &mut PeerCore,
        length: usize,
        connect: &ConnectPacket,
        link: Connect,
        key: Key,
    ) -> bool {
        peer.record_received(length);
        let remote_time = connect.header.time;

        match peer.state.get() {
            State::Disconnected => true,
            State::Connecting => {
                core.latest_remote_time = remote_time;
                if !core.session.is_secure() {
                    // an insecure request cannot cross with a secure one
                    peer.reset(core, PeerReason::Error, ResetMode::Passive);
                    return true;
                }
                if core.session.validates_remote_key() {
                    if core.session.remote_key != Some(key) {
                        peer.record_dropped();
                        return false;
                    }
                    peer.on_cross_connecting(core, remote_time, connect.session, link, None);
                } else {
                    peer.on_cross_connecting(core, remote_time, connect.session, link, Some(key));
                }
                false
            }
            state if core.latest_remote_time < remote_time => {
                if !core.session.is_secure() {
                    peer.reset(core, PeerReason::Error, ResetMode::Passive);
                    return true;
                }
                // a secure CONNECT is not authenticated, so it can never
                // reset a session: only a retransmission is answered
                if core.session.remote_key == Some(key) && state == State::Accepting {
                    core.latest_remote_time = remote_time;
                    peer.accept(core, remote_time);
                }
                false
            }
            _ => false,
        }
    }

    fn on_accept(&self, time: Time, endpoint: SocketAddr, packet: &[u8]) {
        let accept = match read_accept(packet) {
            Some(accept) => accept,
            None => return,
        };
        let peer = match self.find(&endpoint) {
            Some(peer) if peer.state.get() != State::Disconnected => peer,
            _ => {
                self.shared
                    .queue_reset(endpoint, accept.session, encode_reset(time, accept.session));
                return;
            }
        };
        let mut core = lock(&peer.core);
        if core.session.is_secure() {
            return;
        }
        peer.record_received(packet.len());

        let negotiated = match self.negotiate(&accept.accept) {
            Some(negotiated) => negotiated,
            None => {
                peer.record_dropped();
                return;
            }
        };
        let remote_time = accept.header.time;
        match peer.state.get() {
            State::Connecting if core.session.local == accept.acknowledged_session => {
                core.latest_remote_time = remote_time;
                core.flow.remote_window = accept.window;
                peer.on_connected(&mut core, time, remote_time, accept.session, negotiated);
            }
            state
                if core.latest_remote_time < remote_time
                    && core.session.remote == accept.session
                    && core.session.local == accept.acknowledged_session =>
            {
                core.latest_remote_time = remote_time;
                core.flow.remote_window = accept.window;
                self.on_later_accept(&peer, &mut core, state, time, remote_time, accept.accept.atm);
            }
            _ => peer.record_dropped(),
        }
    }

    fn on_secure_accept(&self, time: Time, endpoint: SocketAddr, packet: &[u8]) {
        let accept = match read_secure_accept(packet) {
            Some(accept) => accept,
            None => return,
        };
        let peer = match self.find(&endpoint) {
            Some(peer) if peer.state.get() != State::Disconnected => peer,
            _ => return,
        };
        let mut core = lock(&peer.core);
        if !core.session.is_secure() {
            peer.record_dropped();
            return;
        }
        let negotiated = match self.negotiate(&accept.accept) {
            Some(negotiated) => negotiated,
            None => {
                peer.record_dropped();
                return;
            }
        };
        let remote_time = accept.header.time;

        let state = peer.state.get();
        if state == State::Connecting {
            if core.session.validates_remote_key() {
                if core.session.remote_key != Some(accept.public_key) {
                    peer.record_dropped();
                    return;
                }
            } else {
                match self.shared.create_cipher(&accept.public_key) {
                    Some(cipher) => core.session.secure_with(accept.public_key, cipher),
                    None => return,
                }
            }
        }

        let window = match core.session.cipher().and_then(|cipher| accept.open(cipher)) {
            Some(window) => window,
            None => {
                peer.record_dropped();
                return;
            }
        };
        peer.record_received(packet.len());

        if state == State::Connecting {
            core.latest_remote_time = remote_time;
            core.flow.remote_window = window;
            peer.on_connected(&mut core, time, remote_time, accept.session, negotiated);
        } else if core.latest_remote_time < remote_time && core.session.remote == accept.session {
            core.latest_remote_time = remote_time;
            core.flow.remote_window = window;
            self.on_later_accept(&peer, &mut core, state, time, remote_time, accept.accept.atm);
        } else {
            peer.record_dropped();
        }
    }

    /// Validates the link of an ACCEPT and clamps it to this host.
    fn negotiate(&self, accept: &Accept) -> Option<Accept> {
        let settings = &self.shared.settings;
        let link = accept.link().negotiate(settings.mtu, settings.max_channel)?;
        Some(Accept::new(
            Connect::new(link.mtu, link.mtc, bandwidth::clamp(link.mbw)),
            accept.atm,
        ))
    }

    /// An ACCEPT received after the connection was established: either our
    /// acceptance crossed with it or the remote host retransmitted it.
    fn on_later_accept(
        &self,
        peer: &Arc<Peer>,
        core: &mut PeerCore,
        state: State,
        time: Time,
        remote_time: Time,
        acknowledged_time: Time,
    ) {
        match state {
            State::Accepting => peer.on_accepted(core, time, acknowledged_time),
            State::Connected if peer.mode() == PeerMode::Active => {
                peer.acknowledge_accept(core, remote_time)
            }
            _ => peer.record_dropped(),
        }
    }

    fn on_data(&self, time: Time, endpoint: SocketAddr, packet: &[u8]) {
        let data = match read_data(packet) {
            Some(data) => data,
            None => return,
        };
        let peer = match self.find(&endpoint) {
            Some(peer) if peer.state.get() != State::Disconnected => peer,
            _ => {
                carambolas_debug!(
                    "[{}] DATA for an unknown session, resetting",
                    to_address_token(endpoint)
                );
                self.shared
                    .queue_reset(endpoint, data.session, encode_reset(time, data.session));
                return;
            }
        };
        let mut core = lock(&peer.core);
        if core.session.is_secure() {
            return;
        }
        peer.record_received(packet.len());

        let remote_time = data.header.time;
        if peer.state.get() == State::Connecting
            || core.session.remote != data.session
            || remote_time < core.latest_remote_time - PACKET_LIFETIME
        {
            peer.record_dropped();
            return;
        }
        if core.latest_remote_time < remote_time {
            core.latest_remote_time = remote_time;
            core.flow.remote_window = data.window;
        }
        peer.on_data(&mut core, time, remote_time, data.body);
    }

    fn on_secure_data(&self, time: Time, endpoint: SocketAddr, packet: &mut [u8]) {
        let length = packet.len();
        let peer = match self.find(&endpoint) {
            Some(peer) if peer.state.get() != State::Disconnected => peer,
            _ => return,
        };
        let mut core = lock(&peer.core);
        if !core.session.is_secure() {
            return;
        }
        let opened = match core.session.cipher() {
            Some(cipher) => open_secure_data(packet, cipher),
            None => None,
        };
        let (header, window, body) = match opened {
            Some(opened) => opened,
            None => {
                peer.record_dropped();
                return;
            }
        };
        peer.record_received(length);

        let remote_time = header.time;
        if peer.state.get() == State::Connecting
            || remote_time < core.latest_remote_time - PACKET_LIFETIME
        {
            peer.record_dropped();
            return;
        }
        if core.latest_remote_time < remote_time {
            core.latest_remote_time = remote_time;
            core.flow.remote_window = window;
        }
        peer.on_data(&mut core, time, remote_time, body);
    }

    /// RESET carries no reliable time, so it is never checked against the
    /// latest remote time and does not count as traffic.
    fn on_reset(&self, endpoint: SocketAddr, packet: &[u8]) {
        let session = match read_reset(packet) {
            Some(session) => session,
            None => return,
        };
        let peer = match self.find(&endpoint) {
            Some(peer) => peer,
            None => return,
        };
        let mut core = lock(&peer.core);
        let state = peer.state.get();
        if state == State::Disconnected || core.session.local != session || core.session.is_secure() {
            return;
        }
        peer.reset(&mut core, reset_reason(state), ResetMode::Passive);
    }

    fn on_secure_reset(&self, endpoint: SocketAddr, packet: &[u8]) {
        let reset = match read_secure_reset(packet) {
            Some(reset) => reset,
            None => return,
        };
        let peer = match self.find(&endpoint) {
            Some(peer) => peer,
            None => return,
        };
        let mut core = lock(&peer.core);
        let state = peer.state.get();
        if state == State::Disconnected || !core.session.is_secure() {
            return;
        }
        if state == State::Connecting {
            if core.session.validates_remote_key() {
                if core.session.remote_key != Some(reset.public_key) {
                    return;
                }
            } else {
                match self.shared.create_cipher(&reset.public_key) {
                    Some(cipher) => core.session.secure_with(reset.public_key, cipher),
                    None => return,
                }
            }
        }
        let verified = match core.session.cipher() {
            Some(cipher) => reset.verify(cipher),
            None => false,
        };
        if verified {
            peer.reset(&mut core, reset_reason(state), ResetMode::Passive);
        }
    }
}
