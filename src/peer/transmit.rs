//! Packet assembly.
//!
//! A DATA packet is filled in three passes over the send list: pending
//! retransmissions first, then messages never transmitted, then a ping when
//! the connection went idle. Acks pending on a channel are written before
//! any of its data.
use crate::carambolas_debug;
use crate::channel::inbound::Inbound;
use crate::channel::outbound::{OutboundMessage, RELIABLE_SEQUENCE_OFFSET, SEQUENCE_OFFSET};
use crate::protocol::ack::write_accept_ack;
use crate::protocol::packet::handshake::{Accept, Connect};
use crate::protocol::packet::{
    begin_data, encode_accept, encode_connect, encode_secure_accept, DATA_HEADER_SIZE,
    SECURE_DATA_HEADER_SIZE,
};
use crate::protocol::{packet_capacity, Delivery, Ordinal, Time};
use crate::util::to_address_token;

use super::core::{Command, PeerCore};
use super::{Counters, Peer};

/// Bytes of an encoded ping: `FLAGS CH SEQ RSN LEN`.
const PING_SIZE: usize = 8;

/// Messages a channel may have in flight, counted in sequence numbers.
const MAX_SEQUENCE_SPAN: u16 = Ordinal::WINDOW_SIZE - 1;

/// A DATA packet started on first use.
struct Assembler {
    packet: Option<Vec<u8>>,
    time: Time,
    session: Option<u32>,
    window: u16,
    limit: usize,
    header: usize,
}

impl Assembler {
    fn new(time: Time, session: Option<u32>, window: u16, limit: usize) -> Self {
        let header = match session {
            Some(_) => DATA_HEADER_SIZE,
            None => SECURE_DATA_HEADER_SIZE,
        };
        Self {
            packet: None,
            time,
            session,
            window,
            limit,
            header,
        }
    }

    fn get(&mut self) -> &mut Vec<u8> {
        let (time, session, window, limit) = (self.time, self.session, self.window, self.limit);
        self.packet
            .get_or_insert_with(|| begin_data(time, session, window, limit))
    }

    /// Room left for messages.
    fn space(&self) -> usize {
        let used = self.packet.as_ref().map_or(self.header, Vec::len);
        self.limit.saturating_sub(used)
    }

    /// Writes the pending ack of a channel. False if it does not fit.
    fn write_ack(&mut self, inbound: &mut Inbound, channel: u8) -> bool {
        if let Some(ack) = inbound.ack_message(channel) {
            let limit = self.limit;
            if !ack.try_write(self.get(), limit) {
                return false;
            }
            inbound.clear_ack();
        }
        true
    }

    /// The packet, unless nothing was written to it.
    fn finish(self) -> Option<Vec<u8>> {
        let header = self.header;
        self.packet.filter(|packet| packet.len() > header)
    }
}

fn patch_u16(packet: &mut [u8], offset: usize, value: u16) {
    packet[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

impl Peer {
    /// Encodes the pending CONNECT or ACCEPT, if it is due.
    pub(crate) fn on_connecting_send(&self, core: &mut PeerCore, time: Time) -> Option<Vec<u8>> {
        if !core.control.transmit {
            return None;
        }
        core.control.transmit = false;

        let settings = &self.shared.settings;
        let link = Connect::new(settings.mtu, settings.max_channel, settings.max_bandwidth);
        let secure = core.session.is_secure();
        let local = core.session.local;
        let encoded = match core.control.command {
            Command::None => return None,
            Command::Connect => {
                let public_key = match secure {
                    true => Some(self.shared.public_key()?),
                    false => None,
                };
                encode_connect(time, local, link, public_key)
            }
            Command::Accept => {
                let accept = Accept::new(link, core.control.acceptance_time);
                let window = core.receive_window;
                if secure {
                    let public_key = *self.shared.public_key()?;
                    let nonce = core.session.next_nonce();
                    let cipher = core.session.cipher()?;
                    encode_secure_accept(time, local, accept, window, &public_key, nonce, cipher)
                } else {
                    encode_accept(time, local, accept, window, core.session.remote)
                }
            }
        };

        match encoded {
            Ok(packet) => {
                core.start_timers(time, settings.connection_timeout);
                Some(packet)
            }
            Err(err) => {
                carambolas_debug!(
                    "[{}] Failed to encode handshake: {}",
                    to_address_token(self.endpoint()),
                    err
                );
                None
            }
        }
    }

    /// Assembles the next DATA packet. Returns `None` when there is nothing
    /// left to send this frame.
    pub(crate) fn on_connected_send(&self, core: &mut PeerCore, time: Time) -> Option<Vec<u8>> {
        let secure = core.session.is_secure();
        let session = match secure {
            true => None,
            false => Some(core.session.local),
        };
        let mut packet = Assembler::new(
            time,
            session,
            core.receive_window,
            packet_capacity(core.mtu, secure),
        );

        if let Some(acknowledged_time) = core.control.accept_ack.take() {
            write_accept_ack(packet.get(), acknowledged_time);
        }

        let mut transmitted = 0u32;
        if core.send_capacity != Some(0) {
            let mut full = false;

            if core.retransmitting > 0 {
                packet.get();
                full = self.retransmit(core, &mut packet, time, &mut transmitted);
                if core.flow.bytes_in_flight == 0 {
                    core.ping = true;
                }
            }

            if !full {
                self.transmit(core, &mut packet, time, &mut transmitted);
            }

            if core.ping {
                core.ping = false;
                if self.backlog() == 0 {
                    self.ping(core, &mut packet, time, &mut transmitted);
                }
            }

            if transmitted > 0 {
                if let Some(capacity) = core.send_capacity.as_mut() {
                    *capacity = capacity.saturating_sub(1);
                }
                core.start_timers(time, self.shared.settings.connection_timeout);
            }
        } else {
            for index in core.send_list.snapshot() {
                let channel = match core.channels.get_mut(index as usize) {
                    Some(channel) => channel,
                    None => {
                        core.send_list.remove(index);
                        continue;
                    }
                };
                if !packet.write_ack(&mut channel.inbound, index) {
                    break;
                }
                match channel.outbound.is_idle() {
                    true => core.send_list.remove(index),
                    false => core.send_list.rotate(),
                }
            }
        }

        let mut packet = packet.finish()?;
        core.session.seal(&mut packet);
        Some(packet)
    }

    /// Retransmits up to the last sequence number the remote host reported
    /// missing. Returns true when the packet is full.
    fn retransmit(
        &self,
        core: &mut PeerCore,
        packet: &mut Assembler,
        time: Time,
        transmitted: &mut u32,
    ) -> bool {
        for index in core.send_list.snapshot() {
            let channel = match core.channels.get_mut(index as usize) {
                Some(channel) => channel,
                None => {
                    core.send_list.remove(index);
                    continue;
                }
            };
            if !packet.write_ack(&mut channel.inbound, index) {
                return true;
            }

            let outbound = &mut channel.outbound;
            while let Some(handle) = outbound.retransmit {
                if outbound.retransmit == outbound.transmit {
                    outbound.retransmit = None;
                    core.retransmitting = core.retransmitting.saturating_sub(1);
                    break;
                }
                let next = outbound.messages.next(handle);
                let message = match outbound.messages.get_mut(handle) {
                    Some(message) if !(message.sequence > outbound.ack.last) => message,
                    _ => {
                        outbound.retransmit = None;
                        core.retransmitting = core.retransmitting.saturating_sub(1);
                        break;
                    }
                };
                match message.encoded.as_ref() {
                    // unreliable: sent once, now given up on
                    None => {
                        let payload = message.payload;
                        outbound.messages.remove(handle);
                        core.flow.bytes_in_flight =
                            core.flow.bytes_in_flight.saturating_sub(payload as u32);
                        self.release_backlog(payload as usize);
                    }
                    Some(encoded) => {
                        if encoded.len() > packet.space() {
                            return true;
                        }
                        encoded.write_to(packet.get());
                        message.latest_send_time = time;
                        *transmitted += message.payload as u32;
                    }
                }
                outbound.retransmit = next;
                if outbound.retransmit == outbound.transmit {
                    outbound.retransmit = None;
                    core.retransmitting = core.retransmitting.saturating_sub(1);
                    break;
                }
            }

            match outbound.is_idle() {
                true => core.send_list.remove(index),
                false => core.send_list.rotate(),
            }
        }
        false
    }

    /// Transmits new messages while the send window allows it.
    fn transmit(&self, core: &mut PeerCore, packet: &mut Assembler, time: Time, transmitted: &mut u32) {
        for index in core.send_list.snapshot() {
            let channel = match core.channels.get_mut(index as usize) {
                Some(channel) => channel,
                None => {
                    core.send_list.remove(index);
                    continue;
                }
            };
            if !packet.write_ack(&mut channel.inbound, index) {
                return;
            }

            let outbound = &mut channel.outbound;
            while let Some(handle) = outbound.transmit {
                let next = outbound.messages.next(handle);
                let message = match outbound.messages.get_mut(handle) {
                    Some(message) => message,
                    None => {
                        outbound.transmit = None;
                        break;
                    }
                };
                if core.flow.available() < message.payload as u32
                    || outbound.next_sequence == outbound.ack.next + MAX_SEQUENCE_SPAN
                {
                    break;
                }

                if message.delivery == Delivery::Unreliable && message.first_send_time < time {
                    let payload = message.payload;
                    outbound.next_sequence += 1;
                    outbound.messages.remove(handle);
                    self.release_backlog(payload as usize);
                    outbound.transmit = next;
                    continue;
                }

                if message.encoded_len() > packet.space() {
                    return;
                }

                let sequence = outbound.next_sequence;
                outbound.next_sequence += 1;
                if message.delivery == Delivery::Reliable {
                    outbound.next_reliable += 1;
                }
                match message.delivery {
                    Delivery::Unreliable => {
                        if let Some(encoded) = message.encoded.take() {
                            let buffer = packet.get();
                            let start = buffer.len();
                            encoded.write_to(buffer);
                            patch_u16(buffer, start + SEQUENCE_OFFSET, sequence.0);
                            patch_u16(
                                buffer,
                                start + RELIABLE_SEQUENCE_OFFSET,
                                outbound.next_reliable.0,
                            );
                        }
                    }
                    Delivery::Semireliable | Delivery::Reliable => {
                        if let Some(encoded) = message.encoded.as_mut() {
                            encoded.overwrite_u16(SEQUENCE_OFFSET, sequence.0);
                            encoded.overwrite_u16(RELIABLE_SEQUENCE_OFFSET, outbound.next_reliable.0);
                            encoded.write_to(packet.get());
                        }
                    }
                }

                let payload = message.payload;
                message.sequence = sequence;
                message.first_send_time = time;
                message.latest_send_time = time;
                Counters::add(&self.counters.data_sent, payload as usize);
                core.data_sent += payload as u64;
                core.flow.bytes_in_flight += payload as u32;
                *transmitted += payload as u32;
                outbound.transmit = next;
            }

            match outbound.is_idle() {
                true => core.send_list.remove(index),
                false => core.send_list.rotate(),
            }
        }
    }

    /// Sends a ping on channel 0, in this packet if it fits or queued
    /// otherwise. Pings are reliable so their ack restarts the idle timer.
    fn ping(&self, core: &mut PeerCore, packet: &mut Assembler, time: Time, transmitted: &mut u32) {
        let pool = &self.shared.pool;
        let outbound = match core.channels.first_mut() {
            Some(channel) => &mut channel.outbound,
            None => return,
        };
        self.reserve_backlog(1);

        if packet.space() < PING_SIZE {
            outbound.append(vec![OutboundMessage::ping(pool, time + i32::MAX as u32)]);
            core.send_list.add_before_current(0);
            return;
        }

        let mut ping = OutboundMessage::ping(pool, time);
        let sequence = outbound.next_sequence;
        outbound.next_sequence += 1;
        outbound.next_reliable += 1;
        if let Some(encoded) = ping.encoded.as_mut() {
            encoded.overwrite_u16(SEQUENCE_OFFSET, sequence.0);
            encoded.overwrite_u16(RELIABLE_SEQUENCE_OFFSET, outbound.next_reliable.0);
            encoded.write_to(packet.get());
        }
        ping.sequence = sequence;
        ping.first_send_time = time;
        ping.latest_send_time = time;
        outbound.messages.push_back(ping);
        core.flow.bytes_in_flight += 1;
        *transmitted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testing::Pair;
    use crate::protocol::packet::read_data;

    #[test]
    fn nothing_to_send_produces_no_packet() {
        let pair = Pair::connected();
        let mut core = crate::util::lock(&pair.a.core);
        pair.a.on_connected_update(&mut core, pair.time, 8192, 8192);
        assert!(pair.a.on_connected_send(&mut core, pair.time).is_none());
    }

    #[test]
    fn messages_are_numbered_on_transmission() {
        let pair = Pair::connected();
        pair.a.send(b"one", Delivery::Reliable, 0).unwrap();
        pair.a.send(b"two", Delivery::Unreliable, 0).unwrap();
        pair.a.send(b"three", Delivery::Reliable, 1).unwrap();

        let mut core = crate::util::lock(&pair.a.core);
        pair.a.on_connected_update(&mut core, pair.time, 8192, 8192);
        let packet = pair.a.on_connected_send(&mut core, pair.time).unwrap();
        assert!(pair.a.on_connected_send(&mut core, pair.time).is_none());

        let data = read_data(&packet).unwrap();
        // FLAGS CH SEQ RSN LEN "one" | FLAGS CH SEQ RSN LEN "two" | ...
        assert_eq!(&data.body[..8], &[0x60, 0, 0, 0, 0, 1, 0, 3]);
        assert_eq!(&data.body[11..19], &[0x20, 0, 0, 1, 0, 1, 0, 3]);
        assert_eq!(&data.body[22..30], &[0x60, 1, 0, 0, 0, 1, 0, 5]);

        assert_eq!(core.flow.bytes_in_flight, 11);
        assert_eq!(core.data_sent, 11);
        assert!(core.timers.ack.is_some());
        // the unreliable message keeps its place but not its bytes
        assert_eq!(core.channels[0].outbound.messages.len(), 2);
        assert!(core.channels[0].outbound.is_idle());
    }

    #[test]
    fn the_send_window_limits_transmission() {
        let pair = Pair::connected();
        let large = vec![1u8; 1000];
        for _ in 0..10 {
            pair.a.send(&large, Delivery::Reliable, 0).unwrap();
        }
        let mut core = crate::util::lock(&pair.a.core);
        pair.a.on_connected_update(&mut core, pair.time, 8192, 8192);
        let window = core.flow.send_window;
        let mut packets = 0;
        while pair.a.on_connected_send(&mut core, pair.time).is_some() {
            packets += 1;
        }
        assert_eq!(packets as u32, window / 1000);
        assert!(core.flow.bytes_in_flight <= window);
        assert!(!core.channels[0].outbound.is_idle());
    }

    #[test]
    fn expired_unreliable_messages_are_dropped() {
        let pair = Pair::connected();
        pair.a
            .send_with(b"late", crate::protocol::QoS::with_timelimit(Delivery::Unreliable, 1), 0)
            .unwrap();
        let later = pair.a.shared.clock.now() + 10;
        let mut core = crate::util::lock(&pair.a.core);
        pair.a.on_connected_update(&mut core, later, 8192, 8192);
        assert!(pair.a.on_connected_send(&mut core, later).is_none());
        assert_eq!(pair.a.backlog(), 0);
        assert_eq!(core.channels[0].outbound.next_sequence, Ordinal(1));
    }

    #[test]
    fn idle_connections_ping() {
        let pair = Pair::connected();
        let mut core = crate::util::lock(&pair.a.core);
        core.ping = true;
        let packet = pair.a.on_connected_send(&mut core, pair.time).unwrap();
        let data = read_data(&packet).unwrap();
        assert_eq!(data.body, &[0x60, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(core.flow.bytes_in_flight, 1);
        assert_eq!(pair.a.backlog(), 1);
        assert!(!core.ping);
    }

    #[test]
    fn zero_capacity_sends_acks_only() {
        let pair = Pair::connected();
        pair.b.send(b"hello", Delivery::Reliable, 0).unwrap();
        pair.transfer_b_to_a();
        pair.a.send(b"data", Delivery::Reliable, 0).unwrap();

        let mut core = crate::util::lock(&pair.a.core);
        pair.a.on_connected_update(&mut core, pair.time, 8192, 8192);
        core.send_capacity = Some(0);
        let packet = pair.a.on_connected_send(&mut core, pair.time).unwrap();
        let data = read_data(&packet).unwrap();
        assert_eq!(data.body[0], 0xA0);
        assert_eq!(data.body.len(), 8);
        assert_eq!(core.flow.bytes_in_flight, 0);
    }
}
