use super::outbound::OutboundMessage;

/// Messages handed over by the application but not yet seen by the worker.
///
/// `Peer::send` pushes under the staging lock; the worker takes everything
/// out once per update and splices it into the channels without holding the
/// lock while transmitting.
#[derive(Debug, Default)]
pub(crate) struct Staging {
    pending: Vec<Vec<OutboundMessage>>,
    /// Channels with pending messages, in the order they got them.
    dirty: Vec<u8>,
}

impl Staging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the messages of one datagram. Fragments of a datagram always
    /// travel together.
    pub fn push(&mut self, channel: u8, messages: Vec<OutboundMessage>) {
        let index = channel as usize;
        if self.pending.len() <= index {
            self.pending.resize_with(index + 1, Vec::new);
        }
        let queue = &mut self.pending[index];
        if queue.is_empty() {
            self.dirty.push(channel);
        }
        queue.extend(messages);
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Takes every pending message out, grouped by channel.
    pub fn drain(&mut self) -> Vec<(u8, Vec<OutboundMessage>)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|channel| (channel, std::mem::take(&mut self.pending[channel as usize])))
            .collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.dirty.clear();
    }
}
