//! The connection state machine.
//!
//! [`PeerCore`] holds the protocol state the worker mutates: channels,
//! timers, flow control and pending control packets. The handlers below are
//! called by the worker with the core locked and never block.
use std::sync::Arc;

use crate::carambolas_debug;
use crate::channel::{Channel, SendList};
use crate::host::event::PeerEvent;
use crate::protocol::packet::handshake::{Accept, Connect};
use crate::protocol::{max_segment_size, Time, PACKET_LIFETIME};
use crate::security::Key;
use crate::util::to_address_token;

use super::controller::{AckTimeouts, FlowControl};
use super::session::{Session, State};
use super::state::{PeerMode, PeerReason, PeerState, ResetMode};
use super::{Counters, Peer};

/// Period after which the static window times are raised to follow the
/// remote clock. Must stay below half the time space.
pub(crate) const WINDOW_ADJUSTMENT_PERIOD: u32 = 24 * 24 * 3600 * 1000;

/// Handshake packet the peer has to (re)send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    None,
    Connect,
    Accept,
}

#[derive(Debug)]
pub(crate) struct Control {
    pub command: Command,
    /// The command is due for transmission.
    pub transmit: bool,
    /// Send time of the CONNECT being accepted.
    pub acceptance_time: Time,
    /// An ACCEPT to acknowledge in the next DATA packet.
    pub accept_ack: Option<Time>,
}

impl Control {
    fn connect(&mut self) {
        if self.command != Command::Connect {
            self.command = Command::Connect;
            self.transmit = true;
        }
    }

    fn accept(&mut self, acceptance_time: Time) {
        if self.command != Command::Accept {
            self.command = Command::Accept;
            self.transmit = true;
            self.acceptance_time = acceptance_time;
        }
    }

    fn clear(&mut self) {
        self.command = Command::None;
        self.transmit = false;
    }
}

/// Deadlines. `None` means stopped.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Timers {
    pub ack: Option<Time>,
    pub connection: Option<Time>,
    pub idle: Option<Time>,
}

fn expired(deadline: Option<Time>, time: Time) -> bool {
    matches!(deadline, Some(deadline) if deadline <= time)
}

#[derive(Debug)]
pub(crate) struct PeerCore {
    pub session: Session,
    pub latest_remote_time: Time,
    pub mtu: u16,
    pub max_channel: u8,
    pub channels: Vec<Channel>,
    pub send_list: SendList,
    pub flow: FlowControl,
    pub control: Control,
    pub timers: Timers,
    /// Consecutive ack timeouts.
    pub ack_failures: u32,
    /// Data packets allowed before the next ack. `None` is unlimited.
    pub send_capacity: Option<u32>,
    /// Channels with a retransmission in progress.
    pub retransmitting: usize,
    pub ping: bool,
    /// Window advertised to the remote host.
    pub receive_window: u16,
    pub window_adjusted_at: Time,
    pub connected_at: Option<Time>,
    /// Payload bytes sent since the connection was established.
    pub data_sent: u64,
}

impl PeerCore {
    pub fn new(session: Session, mtu: u16, timeouts: AckTimeouts) -> Self {
        let window_adjusted_at = Time(session.local);
        Self {
            flow: FlowControl::new(max_segment_size(mtu, session.is_secure()), timeouts),
            session,
            latest_remote_time: Time(0),
            mtu,
            max_channel: 0,
            channels: Vec::new(),
            send_list: SendList::default(),
            control: Control {
                command: Command::None,
                transmit: false,
                acceptance_time: Time(0),
                accept_ack: None,
            },
            timers: Timers::default(),
            ack_failures: 0,
            send_capacity: None,
            retransmitting: 0,
            ping: false,
            receive_window: u16::MAX,
            window_adjusted_at,
            connected_at: None,
            data_sent: 0,
        }
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
        self.flow
            .set_max_segment_size(max_segment_size(mtu, self.session.is_secure()));
    }

    /// Opens channels `0..=max_channel` for a connection requested at
    /// `remote_time`.
    fn open_channels(&mut self, max_channel: u8, remote_time: Time) {
        let count = max_channel as usize + 1;
        self.max_channel = max_channel;
        self.channels = (0..count).map(|_| Channel::new(remote_time)).collect();
        self.send_list = SendList::new(count);
    }

    /// Starts the ack and connection timers unless they are running.
    pub fn start_timers(&mut self, time: Time, connection_timeout: u32) {
        if self.timers.ack.is_none() {
            self.timers.ack = Some(time + self.flow.ack_timeout);
        }
        if self.timers.connection.is_none() {
            self.timers.connection = Some(time + connection_timeout);
        }
    }

    pub fn restart_timers(&mut self, time: Time, connection_timeout: u32) {
        self.timers.ack = Some(time + self.flow.ack_timeout);
        self.timers.connection = Some(time + connection_timeout);
    }

    /// Every ack was matched: traffic is idle from now on.
    pub fn stop_timers(&mut self, time: Time, idle_timeout: u32) {
        self.timers.ack = None;
        self.timers.connection = None;
        self.timers.idle = Some(time + idle_timeout);
    }

    /// Feeds a round trip sample taken from an acknowledged time.
    pub fn sample(&mut self, time: Time, acknowledged_time: Time) {
        if acknowledged_time <= time {
            self.flow.on_sample(time - acknowledged_time);
        }
        self.send_capacity = None;
        self.ack_failures = 0;
    }

    pub fn dispose(&mut self) {
        self.channels.clear();
        self.send_list.clear();
        self.session.dispose();
        self.timers = Timers::default();
        self.control.clear();
        self.control.accept_ack = None;
        self.flow.round_trip_time = 0;
        self.flow.remote_window = 0;
        self.flow.remote_bandwidth = 0;
        self.flow.bytes_in_flight = 0;
    }
}

impl Peer {
    fn connection_timeout(&self) -> u32 {
        self.shared.settings.connection_timeout
    }

    fn idle_timeout(&self) -> u32 {
        self.shared.settings.idle_timeout
    }

    /// An active peer starts connecting.
    pub(crate) fn on_connecting(&self, core: &mut PeerCore) {
        self.state.set(State::Connecting);
        core.flow.restart();
        core.flow.remote_window = u16::MAX;
        core.control.connect();
    }

    /// A passive peer answers a CONNECT. `link` is already negotiated.
    pub(crate) fn on_accepting(
        &self,
        core: &mut PeerCore,
        remote_time: Time,
        remote_session: u32,
        link: Connect,
    ) {
        self.state.set(State::Accepting);
        core.latest_remote_time = remote_time;
        core.session.remote = remote_session;
        core.open_channels(link.mtc, remote_time);
        core.set_mtu(link.mtu);
        self.set_link(link.mtu, link.mtc);
        core.flow.remote_bandwidth = link.mbw >> 3;
        core.flow.restart();
        core.control.accept(remote_time);
    }

    /// Our CONNECT crossed with one from the remote host. A secure session
    /// that did not know the remote key yet is keyed first.
    pub(crate) fn on_cross_connecting(
        &self,
        core: &mut PeerCore,
        remote_time: Time,
        remote_session: u32,
        link: Connect,
        remote_key: Option<Key>,
    ) {
        if let Some(key) = remote_key {
            match self.shared.create_cipher(&key) {
                Some(cipher) => core.session.secure_with(key, cipher),
                None => return,
            }
        }
        carambolas_debug!(
            "[{}] Connection requests crossed, accepting",
            to_address_token(self.endpoint())
        );
        self.on_accepting(core, remote_time, remote_session, link);
    }

    /// An active peer got its ACCEPT.
    pub(crate) fn on_connected(
        self: &Arc<Self>,
        core: &mut PeerCore,
        time: Time,
        remote_time: Time,
        remote_session: u32,
        accept: Accept,
    ) {
        self.state.set(State::Connected);
        core.session.remote = remote_session;
        core.connected_at = Some(time);
        core.window_adjusted_at = time;
        core.open_channels(accept.mtc, remote_time);
        core.set_mtu(accept.mtu);
        self.set_link(accept.mtu, accept.mtc);
        core.flow.remote_bandwidth = accept.mbw >> 3;
        core.flow.restart();
        core.control.clear();
        core.control.accept_ack = Some(core.latest_remote_time);
        self.on_ack_matched(core, time, accept.atm);
        carambolas_debug!("[{}] Connected", to_address_token(self.endpoint()));
        self.shared.add_event(self, PeerEvent::Connection);
    }

    /// A passive peer got its ACCEPT acknowledged.
    pub(crate) fn on_accepted(self: &Arc<Self>, core: &mut PeerCore, time: Time, acknowledged_time: Time) {
        self.state.set(State::Connected);
        core.connected_at = Some(time);
        core.window_adjusted_at = time;
        core.control.clear();
        self.on_ack_matched(core, time, acknowledged_time);
        carambolas_debug!("[{}] Accepted", to_address_token(self.endpoint()));
        self.shared.add_event(self, PeerEvent::Connection);
    }

    /// A handshake packet was acknowledged.
    fn on_ack_matched(&self, core: &mut PeerCore, time: Time, acknowledged_time: Time) {
        core.sample(time, acknowledged_time);
        core.stop_timers(time, self.idle_timeout());
    }

    /// The remote host retransmitted its ACCEPT: acknowledge it again.
    pub(crate) fn acknowledge_accept(&self, core: &mut PeerCore, remote_time: Time) {
        core.control.accept_ack = Some(remote_time);
    }

    /// Re-sends the ACCEPT for a retransmitted CONNECT.
    pub(crate) fn accept(&self, core: &mut PeerCore, remote_time: Time) {
        core.control.accept(remote_time);
    }

    /// Checks the timers. Returns false if the peer was reset.
    pub(crate) fn on_update(self: &Arc<Self>, core: &mut PeerCore, time: Time) -> bool {
        if expired(core.timers.connection, time) {
            self.reset(core, self.timeout_reason(), ResetMode::Active);
            return false;
        }

        if expired(core.timers.ack, time) {
            Counters::add(&self.counters.timeouts, 1);
            core.ack_failures += 1;
            if core.ack_failures >= self.shared.settings.ack_fail_limit {
                self.reset(core, self.timeout_reason(), ResetMode::Active);
                return false;
            }
            self.on_ack_timeout(core);
        }

        if expired(core.timers.idle, time) {
            core.timers.idle = None;
            core.ping = true;
        }
        true
    }

    /// A peer that never got an answer was unreachable rather than timed out.
    fn timeout_reason(&self) -> PeerReason {
        match self.state.get() {
            State::Connecting => PeerReason::Unreachable,
            _ => PeerReason::TimedOut,
        }
    }

    fn on_ack_timeout(&self, core: &mut PeerCore) {
        carambolas_debug!(
            true,
            "[{}] Ack timeout #{} after {} ms",
            to_address_token(self.endpoint()),
            core.ack_failures,
            core.flow.ack_timeout
        );
        core.flow
            .on_timeout(core.ack_failures, core.retransmitting > 0);

        if core.control.command != Command::None {
            core.control.transmit = true;
        } else {
            for (index, channel) in core.channels.iter_mut().enumerate() {
                let outbound = &mut channel.outbound;
                if !outbound.in_flight() {
                    continue;
                }
                if outbound.retransmit.is_none() {
                    core.retransmitting += 1;
                    outbound.ack.last = outbound.next_sequence - 1;
                    outbound.ack.count = 1;
                    core.send_list.add_before_current(index as u8);
                }
                outbound.retransmit = outbound.messages.first();
            }
            core.send_capacity = Some(1);
        }

        core.timers.ack = None;
        core.timers.idle = None;
    }

    /// Per frame update of a connected peer. `upstream_share` and
    /// `downstream_share` are this peer's part of the host buffers.
    pub(crate) fn on_connected_update(
        self: &Arc<Self>,
        core: &mut PeerCore,
        time: Time,
        upstream_share: u32,
        downstream_share: u32,
    ) -> bool {
        if !self.on_update(core, time) {
            return false;
        }

        if time - core.window_adjusted_at > WINDOW_ADJUSTMENT_PERIOD {
            let floor = core.latest_remote_time - PACKET_LIFETIME;
            for channel in core.channels.iter_mut() {
                channel.inbound.adjust_windows(floor);
            }
            core.window_adjusted_at = time;
        }

        let elapsed = core.connected_at.map_or(0, |at| (time - at) as u64);
        let allowed = core.flow.remote_bandwidth as u64 * elapsed / 1000;
        let bandwidth_window = allowed.saturating_sub(core.data_sent);
        core.flow
            .update_send_window(upstream_share, bandwidth_window);

        for (index, messages) in self.take_staged() {
            match core.channels.get_mut(index as usize) {
                Some(channel) => {
                    channel.outbound.append(messages);
                    if channel.outbound.transmit.is_some() {
                        core.send_list.add_before_current(index);
                    }
                }
                None => {
                    let bytes: usize = messages.iter().map(|m| m.payload as usize).sum();
                    self.release_backlog(bytes);
                }
            }
        }

        core.receive_window = downstream_share.min(u16::MAX as u32) as u16;
        true
    }

    /// Disconnects the peer from the worker side. An active reset tells the
    /// remote host with a RESET when it knows our session.
    pub(crate) fn reset(self: &Arc<Self>, core: &mut PeerCore, reason: PeerReason, mode: ResetMode) {
        let previous = match self.state.try_disconnect() {
            Some(previous) => previous,
            None => return,
        };
        carambolas_debug!(
            "[{}] Reset ({}) from {:?}",
            to_address_token(self.endpoint()),
            reason,
            previous
        );
        if mode == ResetMode::Active && previous != State::Connecting {
            self.queue_reset(core);
        }
        // an incoming connection never announced has nothing to report
        if previous == State::Accepting && self.mode() == PeerMode::Passive {
            self.set_user_state(PeerState::Disconnected);
            return;
        }
        self.shared
            .add_event(self, PeerEvent::Disconnection(reason));
    }
}
