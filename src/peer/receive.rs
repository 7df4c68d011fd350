//! DATA packet processing: acknowledgements and inbound data.
use std::sync::Arc;

use crate::carambolas_debug;
use crate::channel::outbound::AckState;
use crate::host::event::{Data, PeerEvent};
use crate::memory::Memory;
use crate::protocol::ack::{Ack, FAST_RETRANSMIT_THRESHOLD};
use crate::protocol::frame::{Message, Messages};
use crate::protocol::{max_fragment_size, Time};
use crate::util::to_address_token;

use super::core::PeerCore;
use super::session::State;
use super::{Counters, Peer};

/// Channels that already had a unit in the current packet.
#[derive(Default)]
struct Seen([u32; 8]);

impl Seen {
    /// Marks `channel`. True the first time.
    fn mark(&mut self, channel: u8) -> bool {
        let (word, bit) = (channel as usize / 32, 1u32 << (channel % 32));
        let first = self.0[word] & bit == 0;
        self.0[word] |= bit;
        first
    }
}

impl Peer {
    /// Processes the messages of a DATA packet that passed every packet
    /// level check.
    pub(crate) fn on_data(self: &Arc<Self>, core: &mut PeerCore, time: Time, remote_time: Time, body: &[u8]) {
        let mut seen = Seen::default();
        let mut delivered: Vec<Memory> = Vec::new();
        let max_fragment_size = max_fragment_size(core.mtu, core.session.is_secure());

        for message in Messages::new(body) {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    carambolas_debug!(
                        "[{}] Dropped DATA: {}",
                        to_address_token(self.endpoint()),
                        err
                    );
                    self.record_dropped();
                    break;
                }
            };
            let state = self.state.get();

            let (index, receipt) = match message {
                Message::AcceptAck(acknowledged_time) => {
                    if state == State::Accepting {
                        self.on_accepted(core, time, acknowledged_time);
                    }
                    continue;
                }
                Message::Ack(ack) => {
                    if state == State::Connected
                        && (ack.channel as usize) < core.channels.len()
                        && ack.count > 0
                    {
                        self.on_ack(core, time, remote_time, &ack);
                    }
                    continue;
                }
                Message::Segment(segment) => {
                    // only a ping may be empty
                    let ping = segment.reliable && segment.channel == 0;
                    if state != State::Connected || (segment.data.is_empty() && !ping) {
                        continue;
                    }
                    let channel = match core.channels.get_mut(segment.channel as usize) {
                        Some(channel) => channel,
                        None => continue,
                    };
                    let first = seen.mark(segment.channel);
                    let receipt = channel.inbound.on_segment(
                        &self.shared.pool,
                        &segment,
                        remote_time,
                        first,
                        &mut delivered,
                    );
                    (segment.channel, receipt)
                }
                Message::Fragment(fragment) => {
                    if state != State::Connected
                        || fragment.datagram_length <= self.max_segment_size()
                        || !fragment.is_well_formed(max_fragment_size)
                    {
                        continue;
                    }
                    let channel = match core.channels.get_mut(fragment.channel as usize) {
                        Some(channel) => channel,
                        None => continue,
                    };
                    let first = seen.mark(fragment.channel);
                    let receipt = channel.inbound.on_fragment(
                        &self.shared.pool,
                        &fragment,
                        max_fragment_size,
                        remote_time,
                        first,
                        &mut delivered,
                    );
                    (fragment.channel, receipt)
                }
            };

            Counters::add(&self.counters.data_received, receipt.received);
            if receipt.ack {
                core.send_list.add_before_current(index);
            }
            for payload in delivered.drain(..) {
                self.shared.add_event(
                    self,
                    PeerEvent::Data(Data {
                        channel: index,
                        payload,
                    }),
                );
            }
        }
    }

    /// Processes an acknowledgement for a channel known to exist.
    pub(crate) fn on_ack(&self, core: &mut PeerCore, time: Time, remote_time: Time, ack: &Ack) {
        let index = ack.channel as usize;
        let connection_timeout = self.shared.settings.connection_timeout;
        if core.flow.bytes_in_flight == 0 {
            return;
        }

        let latest_send_time = {
            let outbound = match core.channels.get(index) {
                Some(channel) => &channel.outbound,
                None => return,
            };
            let first = match outbound.messages.first() {
                Some(first) if Some(first) != outbound.transmit => first,
                _ => return,
            };
            let first = match outbound.messages.get(first) {
                Some(message) => message,
                None => return,
            };
            if ack.acknowledged_time < first.first_send_time
                || ack.last < ack.next
                || ack.next > outbound.next_sequence
                || ack.last > outbound.next_sequence
                || ack.next < outbound.ack.next
            {
                return;
            }
            first.latest_send_time
        };

        core.sample(time, ack.acknowledged_time);
        let outbound = &mut core.channels[index].outbound;

        if ack.next == outbound.ack.next {
            core.timers.ack = Some(time + core.flow.ack_timeout);
            core.timers.connection = Some(time + connection_timeout);
            if outbound.latest_ack_remote_time < remote_time {
                outbound.latest_ack_remote_time = remote_time;
                outbound.ack.last = ack.last;
                outbound.ack.count = outbound.ack.count.saturating_add(ack.count);
            } else if ack.is_gap() && ack.acknowledged_time >= latest_send_time {
                outbound.ack.count = outbound.ack.count.saturating_add(ack.count);
            }
        } else {
            let mut acknowledged = 0usize;
            while let Some(handle) = outbound.messages.first() {
                if Some(handle) == outbound.transmit {
                    break;
                }
                match outbound.messages.get(handle) {
                    Some(message) if message.sequence < ack.next => {}
                    _ => break,
                }
                if let Some(message) = outbound.messages.remove(handle) {
                    acknowledged += message.payload as usize;
                }
            }
            self.release_backlog(acknowledged);
            core.flow.on_acknowledged(acknowledged as u32);

            if core.flow.bytes_in_flight == 0 {
                core.timers.ack = None;
                core.timers.connection = None;
                core.timers.idle = Some(time + self.shared.settings.idle_timeout);
                if outbound.retransmit.take().is_some() {
                    core.retransmitting = core.retransmitting.saturating_sub(1);
                }
            } else {
                core.timers.ack = Some(time + core.flow.ack_timeout);
                core.timers.connection = Some(time + connection_timeout);
                if outbound.retransmit.is_some() {
                    if ack.next > outbound.ack.last {
                        outbound.retransmit = None;
                        core.retransmitting = core.retransmitting.saturating_sub(1);
                    } else if outbound.retransmit_is_stale() {
                        outbound.retransmit = outbound.messages.first();
                    }
                }
            }

            outbound.latest_ack_remote_time = remote_time;
            outbound.ack = AckState {
                next: ack.next,
                last: ack.last,
                count: ack.count,
            };
            outbound.fast_retransmitted = false;
        }

        if outbound.retransmit.is_none()
            && outbound.ack.count >= FAST_RETRANSMIT_THRESHOLD
            && !outbound.fast_retransmitted
            && outbound.in_flight()
        {
            carambolas_debug!(
                true,
                "[{}] Fast retransmit on channel {} from {}",
                to_address_token(self.endpoint()),
                index,
                outbound.ack.next
            );
            outbound.retransmit = outbound.messages.first();
            outbound.fast_retransmitted = true;
            core.retransmitting += 1;
            core.send_list.add_before_current(index as u8);
            Counters::add(&self.counters.fast_retransmissions, 1);
            if core.retransmitting == 1 {
                core.flow.reduce_link_capacity();
            }
        }
    }
}
