//! Two peers wired back to back, without hosts or sockets.
use std::sync::Arc;

use crate::host::event::PeerEvent;
use crate::host::settings::Settings;
use crate::host::shared::Shared;
use crate::protocol::packet::handshake::{Accept, Connect};
use crate::protocol::packet::read_data;
use crate::protocol::{bandwidth, Time};
use crate::util::{lock, Clock};

use super::{Peer, PeerMode, PeerState};

pub(crate) struct Pair {
    /// The side that connected.
    pub a: Arc<Peer>,
    /// The side that accepted.
    pub b: Arc<Peer>,
    /// A time after the handshake, before the idle timers fire.
    pub time: Time,
}

impl Pair {
    pub fn connected() -> Self {
        let start = Time(10_000);
        let settings = Settings {
            max_channel: 1,
            ..Settings::default()
        };
        let shared = || Arc::new(Shared::new(settings.clone(), Clock::starting_at(start.0)));
        let a = Arc::new(Peer::new(
            shared(),
            start,
            "127.0.0.1:2001".parse().unwrap(),
            PeerMode::Active,
            0,
            None,
        ));
        let b = Arc::new(Peer::new(
            shared(),
            start + 1,
            "127.0.0.1:2000".parse().unwrap(),
            PeerMode::Passive,
            0,
            None,
        ));

        {
            let mut core_a = lock(&a.core);
            let mut core_b = lock(&b.core);
            let link = Connect::new(1280, 1, bandwidth::MAX);
            a.on_connecting(&mut core_a);
            b.on_accepting(&mut core_b, start, core_a.session.local, link);
            let remote_session = core_b.session.local;
            a.on_connected(&mut core_a, start, start, remote_session, Accept::new(link, start));
            core_a.control.accept_ack = None;
            b.on_accepted(&mut core_b, start, start);
        }
        for peer in [&a, &b] {
            peer.set_user_state(PeerState::Connected);
            while peer.dequeue().is_some() {}
            while peer.shared.next_event_peer().is_some() {}
        }

        Self {
            a,
            b,
            time: start + 500,
        }
    }

    /// Sends everything `a` has for `b`. Returns the number of packets.
    pub fn transfer_a_to_b(&self) -> usize {
        Self::transfer(&self.a, &self.b, self.time)
    }

    pub fn transfer_b_to_a(&self) -> usize {
        Self::transfer(&self.b, &self.a, self.time)
    }

    fn transfer(from: &Arc<Peer>, to: &Arc<Peer>, time: Time) -> usize {
        let packets = {
            let mut core = lock(&from.core);
            from.on_connected_update(&mut core, time, 8192, 8192);
            let mut packets = Vec::new();
            while let Some(packet) = from.on_connected_send(&mut core, time) {
                packets.push(packet);
            }
            packets
        };
        let mut core = lock(&to.core);
        for packet in packets.iter() {
            let data = read_data(packet).expect("a valid DATA packet");
            to.on_data(&mut core, time, data.header.time, data.body);
        }
        packets.len()
    }

    /// Every event pending on `peer`.
    pub fn events(peer: &Arc<Peer>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Some(event) = peer.dequeue() {
            events.push(event);
        }
        events
    }
}
