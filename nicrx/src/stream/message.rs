use tracing::debug;

use super::{MemoryAccess, StreamCore, StreamEnv, StreamState};
use crate::context::PostedReceive;
use crate::error::ReceiveResult;
use crate::packet::{MessageHeader, Packet};
use crate::providers::{Completion, NeedReceive, NicProviders};

/// Tagged message matched against the host's posted receives.
#[derive(Debug)]
pub(crate) struct MessageStream {
    header: MessageHeader,
    matched: Option<PostedReceive>,
    /// Header payload that arrived before any receive matched.
    held: Option<Vec<u8>>,
    data: Vec<u8>,
    received: usize,
}

impl MessageStream {
    pub(crate) fn new(header: MessageHeader) -> Self {
        Self {
            header,
            matched: None,
            held: None,
            data: Vec::new(),
            received: 0,
        }
    }

    pub(crate) fn header(&self) -> MessageHeader {
        self.header
    }

    pub(crate) fn handle_first_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        match env.ctx.find_match(&core.key, &self.header) {
            Some(entry) => {
                debug!(key = %core.key, tag = self.header.tag, cookie = entry.cookie, "Header matched posted receive");
                self.matched = Some(entry);
                core.state = StreamState::Receiving;
                self.deliver(core, packet.payload, env);
            }
            None => {
                self.held = Some(packet.payload);
                core.state = StreamState::AwaitingMatch;
                env.metrics.record_need_receive();
                let notice = NeedReceive {
                    pid: core.key.dest_pid,
                    source_node: core.key.source_node,
                    source_pid: core.key.source_pid,
                    tag: self.header.tag,
                    length: self.header.length,
                };
                env.ctx.need_receive(core.id, notice, env.providers.host());
            }
        }
        Ok(())
    }

    pub(crate) fn handle_body_packet<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        self.deliver(core, packet.payload, env);
        Ok(())
    }

    pub(crate) fn resume<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        entry: PostedReceive,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        debug!(key = %core.key, tag = self.header.tag, cookie = entry.cookie, "Blocked header matched late");
        self.matched = Some(entry);
        core.state = StreamState::Receiving;
        if let Some(held) = self.held.take() {
            self.deliver(core, held, env);
        }
        Ok(())
    }

    /// Copy `payload` into the matched buffer, truncating at its capacity.
    fn deliver<P: NicProviders>(
        &mut self,
        core: &mut StreamCore,
        payload: Vec<u8>,
        env: &mut StreamEnv<'_, P>,
    ) {
        if payload.is_empty() {
            return;
        }
        let capacity = self.matched.as_ref().map_or(0, |entry| entry.capacity);
        let room = capacity.saturating_sub(self.data.len());
        let stored = payload.len().min(room);
        self.data.extend_from_slice(&payload[..stored]);
        self.received += payload.len();
        core.issue(MemoryAccess::HostWrite, stored, env);
    }

    pub(crate) fn complete(&mut self, core: &StreamCore) -> Completion {
        let cookie = self.matched.as_ref().map_or(0, |entry| entry.cookie);
        Completion::Message {
            pid: core.key.dest_pid,
            cookie,
            source_node: core.key.source_node,
            source_pid: core.key.source_pid,
            tag: self.header.tag,
            length: self.received,
            truncated: self.received > self.data.len(),
            data: std::mem::take(&mut self.data),
        }
    }
}
