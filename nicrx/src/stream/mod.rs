//! Per-conversation reassembly state machines.
//!
//! ```text
//!  AwaitingHeader ──header──> Receiving ──tail + drained──> Complete
//!        │                       ^
//!        └──no posted receive──> AwaitingMatch
//! ```
//!
//! The variant ([`StreamKind`]) is chosen from the header opcode when the
//! stream is created and never changes. Every variant exposes the same
//! capability set: first packet, body packet, memory callback, blocked check.
//!
//! A stream never frees itself. On completion it asks its
//! [`ReceiveContext`] to schedule a deferred delete; the engine reclaims it
//! from the [`StreamTable`] at the end of the pass.

mod message;
mod rdma;
mod shmem;

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::config::{ReceiveConfig, SequencePolicy};
use crate::context::{PostedReceive, ReceiveContext};
use crate::error::{ReceiveError, ReceiveResult};
use crate::metrics::ReceiveMetrics;
use crate::packet::{ConversationKey, MessageHeader, Opcode, Packet, Response};
use crate::providers::{
    Completion, EngineClock, HostInterface, HostMemoryModel, NicProviders, Telemetry,
    TelemetrySample, Transmit,
};

use message::MessageStream;
use rdma::RdmaStream;
use shmem::ShmemStream;

/// Handle of a stream in the engine's table. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

/// Lifecycle state shared by every stream variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, header not processed yet
    AwaitingHeader,
    /// Header processed, no posted receive matched it yet
    AwaitingMatch,
    /// Applying packets to the destination
    Receiving,
    /// Finished, waiting for reclamation
    Complete,
}

/// Variant selected from the header opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Tagged message matched against posted receives
    Message,
    /// RDMA put, get or get response
    Rdma,
    /// Shared-memory operation
    Shmem,
}

/// Kind of modeled memory traffic a callback completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    /// Host memory read, counted as pending host work
    HostRead,
    /// Host memory write, counted as pending host work
    HostWrite,
    /// NIC-local access; sets the variant's resource flag instead
    NicAccess,
}

/// Continuation handed to the clock and returned to
/// `ReceiveScheduler::on_memory_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryToken {
    /// Stream waiting for the access
    pub stream: StreamId,
    /// Access that completed
    pub access: MemoryAccess,
}

/// Everything a stream may touch while handling a packet or callback.
pub(crate) struct StreamEnv<'a, P: NicProviders> {
    pub(crate) ctx: &'a mut ReceiveContext,
    pub(crate) providers: &'a P,
    pub(crate) config: &'a ReceiveConfig,
    pub(crate) metrics: &'a mut ReceiveMetrics,
}

impl<P: NicProviders> StreamEnv<'_, P> {
    pub(crate) fn respond(&mut self, response: Response) {
        trace!(dest = %response.dest_node, pid = %response.dest_pid, bytes = response.payload.len(), "Sending response");
        self.metrics.record_response();
        self.providers.transmit().send(response);
    }
}

/// Bookkeeping common to every variant.
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub(crate) id: StreamId,
    pub(crate) key: ConversationKey,
    pub(crate) state: StreamState,
    pub(crate) expected_sequence: u32,
    pub(crate) pending_operations: usize,
    pub(crate) tail_seen: bool,
}

impl StreamCore {
    /// Schedule a modeled memory access whose completion comes back as a
    /// [`MemoryToken`].
    pub(crate) fn issue<P: NicProviders>(
        &mut self,
        access: MemoryAccess,
        bytes: usize,
        env: &mut StreamEnv<'_, P>,
    ) {
        let memory = env.providers.memory();
        let delay = match access {
            MemoryAccess::HostRead => memory.host_read_delay(bytes),
            MemoryAccess::HostWrite => memory.host_write_delay(bytes),
            MemoryAccess::NicAccess => memory.nic_access_delay(bytes),
        };
        if access != MemoryAccess::NicAccess {
            self.pending_operations += 1;
        }
        trace!(stream = self.id.0, ?access, bytes, ?delay, "Memory access issued");
        env.providers.clock().schedule_callback(
            delay,
            MemoryToken {
                stream: self.id,
                access,
            },
        );
    }

    pub(crate) fn out_of_bounds(&self, offset: usize, len: usize, capacity: usize) -> ReceiveError {
        ReceiveError::OutOfBounds {
            key: self.key,
            offset,
            len,
            capacity,
        }
    }
}

#[derive(Debug)]
enum StreamVariant {
    Message(MessageStream),
    Rdma(RdmaStream),
    Shmem(ShmemStream),
}

/// One in-flight conversation.
#[derive(Debug)]
pub struct Stream {
    core: StreamCore,
    variant: StreamVariant,
}

impl Stream {
    /// Create a stream for the header packet `header`.
    ///
    /// Fails with [`ReceiveError::BodyBeforeHeader`] when `header` does not
    /// carry a header opcode.
    pub(crate) fn new(id: StreamId, header: &Packet) -> ReceiveResult<Self> {
        let key = header.key();
        let variant = match header.opcode {
            Opcode::Message(h) if header.is_header => StreamVariant::Message(MessageStream::new(h)),
            Opcode::Rdma(h) if header.is_header => StreamVariant::Rdma(RdmaStream::new(h)),
            Opcode::Shmem(h) if header.is_header => StreamVariant::Shmem(ShmemStream::new(h)),
            _ => return Err(ReceiveError::BodyBeforeHeader(key)),
        };
        Ok(Self {
            core: StreamCore {
                id,
                key,
                state: StreamState::AwaitingHeader,
                expected_sequence: header.sequence,
                pending_operations: 0,
                tail_seen: false,
            },
            variant,
        })
    }

    /// Table handle.
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    /// Conversation served.
    pub fn key(&self) -> ConversationKey {
        self.core.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.core.state
    }

    /// Variant chosen at header time.
    pub fn kind(&self) -> StreamKind {
        match self.variant {
            StreamVariant::Message(_) => StreamKind::Message,
            StreamVariant::Rdma(_) => StreamKind::Rdma,
            StreamVariant::Shmem(_) => StreamKind::Shmem,
        }
    }

    /// Host operations in flight.
    pub fn pending_operations(&self) -> usize {
        self.core.pending_operations
    }

    /// Whether the scheduler must stop feeding this stream.
    ///
    /// True while waiting for a posted receive, once the tail was consumed,
    /// when host work in flight reaches `max_queue_depth`, or while the
    /// variant waits on a NIC resource.
    pub fn is_blocked(&self, max_queue_depth: usize) -> bool {
        match self.core.state {
            StreamState::AwaitingMatch | StreamState::Complete => true,
            StreamState::AwaitingHeader | StreamState::Receiving => {
                self.core.tail_seen
                    || self.core.pending_operations >= max_queue_depth
                    || self.awaiting_resource()
            }
        }
    }

    fn awaiting_resource(&self) -> bool {
        match &self.variant {
            StreamVariant::Message(_) => false,
            StreamVariant::Rdma(s) => s.awaiting_resource(),
            StreamVariant::Shmem(s) => s.awaiting_resource(),
        }
    }

    /// Header of a message stream still waiting for a posted receive.
    pub(crate) fn pending_match(&self) -> Option<MessageHeader> {
        match (&self.variant, self.core.state) {
            (StreamVariant::Message(s), StreamState::AwaitingMatch) => Some(s.header()),
            _ => None,
        }
    }

    /// Apply the next packet of this conversation.
    pub(crate) fn process<P: NicProviders>(
        &mut self,
        packet: Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        match self.core.state {
            StreamState::AwaitingHeader => {}
            StreamState::Receiving => {
                if packet.is_header {
                    return Err(ReceiveError::DuplicateStream(self.core.key));
                }
                if !self.accept_sequence(&packet, env)? {
                    return Ok(());
                }
            }
            StreamState::AwaitingMatch | StreamState::Complete => {
                return Err(ReceiveError::Faulted(format!(
                    "packet fed to {:?} stream on {}",
                    self.core.state, self.core.key
                )));
            }
        }

        trace!(
            stream = self.core.id.0,
            key = %self.core.key,
            sequence = packet.sequence,
            bytes = packet.payload_size,
            tail = packet.is_tail,
            "Stream packet"
        );
        self.core.expected_sequence = packet.sequence.wrapping_add(1);
        let is_tail = packet.is_tail;
        let first = self.core.state == StreamState::AwaitingHeader;

        let core = &mut self.core;
        match (&mut self.variant, first) {
            (StreamVariant::Message(s), true) => s.handle_first_packet(core, packet, env)?,
            (StreamVariant::Message(s), false) => s.handle_body_packet(core, packet, env)?,
            (StreamVariant::Rdma(s), true) => s.handle_first_packet(core, packet, env)?,
            (StreamVariant::Rdma(s), false) => s.handle_body_packet(core, packet, env)?,
            (StreamVariant::Shmem(s), true) => s.handle_first_packet(core, packet, env)?,
            (StreamVariant::Shmem(s), false) => s.handle_body_packet(core, packet, env)?,
        }

        if is_tail {
            self.core.tail_seen = true;
        }
        self.try_complete(env)
    }

    /// Resume a stream parked in `AwaitingMatch` with the receive that
    /// matched its header.
    pub(crate) fn resume<P: NicProviders>(
        &mut self,
        entry: PostedReceive,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        let core = &mut self.core;
        match &mut self.variant {
            StreamVariant::Message(s) => s.resume(core, entry, env)?,
            _ => {
                return Err(ReceiveError::Faulted(format!(
                    "posted receive offered to non-message stream on {}",
                    core.key
                )))
            }
        }
        self.try_complete(env)
    }

    /// Handle a memory callback issued by this stream.
    pub(crate) fn on_memory_complete<P: NicProviders>(
        &mut self,
        access: MemoryAccess,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<()> {
        if access != MemoryAccess::NicAccess {
            self.core.pending_operations = self
                .core
                .pending_operations
                .checked_sub(1)
                .ok_or_else(|| {
                    ReceiveError::Faulted(format!(
                        "memory callback without pending operation on {}",
                        self.core.key
                    ))
                })?;
        }
        let core = &mut self.core;
        match &mut self.variant {
            StreamVariant::Message(_) => {}
            StreamVariant::Rdma(s) => s.on_memory_complete(core, access, env)?,
            StreamVariant::Shmem(s) => s.on_memory_complete(core, access, env)?,
        }
        self.try_complete(env)
    }

    /// Returns `false` when the packet must be discarded.
    fn accept_sequence<P: NicProviders>(
        &mut self,
        packet: &Packet,
        env: &mut StreamEnv<'_, P>,
    ) -> ReceiveResult<bool> {
        let expected = self.core.expected_sequence;
        if packet.sequence == expected {
            return Ok(true);
        }
        match env.config.sequence_policy {
            SequencePolicy::FailFast => Err(ReceiveError::SequenceGap {
                key: self.core.key,
                expected,
                got: packet.sequence,
            }),
            SequencePolicy::Resync => {
                warn!(key = %self.core.key, expected, got = packet.sequence, "Sequence gap, resynchronizing");
                env.metrics.record_sequence_anomaly();
                env.providers.telemetry().record(TelemetrySample::SequenceAnomaly);
                Ok(true)
            }
            SequencePolicy::Discard => {
                warn!(key = %self.core.key, expected, got = packet.sequence, "Sequence gap, discarding packet");
                env.metrics.record_sequence_anomaly();
                env.providers.telemetry().record(TelemetrySample::SequenceAnomaly);
                Ok(false)
            }
        }
    }

    fn try_complete<P: NicProviders>(&mut self, env: &mut StreamEnv<'_, P>) -> ReceiveResult<()> {
        if self.core.state != StreamState::Receiving
            || !self.core.tail_seen
            || self.core.pending_operations > 0
            || self.awaiting_resource()
        {
            return Ok(());
        }

        let pid = self.core.key.dest_pid;
        let core = &mut self.core;
        let completion: Completion = match &mut self.variant {
            StreamVariant::Message(s) => s.complete(core),
            StreamVariant::Rdma(s) => s.complete(core)?,
            StreamVariant::Shmem(s) => s.complete(core, env)?,
        };

        self.core.state = StreamState::Complete;
        debug!(stream = self.core.id.0, key = %self.core.key, %pid, "Stream complete");
        env.metrics.record_completion();
        env.providers.host().complete(completion);
        env.ctx.schedule_deferred_delete(self.core.id);
        Ok(())
    }
}

/// Arena owning every live stream, indexed by id and by conversation key.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<StreamId, Stream>,
    by_key: HashMap<ConversationKey, StreamId>,
    next_id: u64,
}

impl StreamTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and insert a stream for `header`.
    pub(crate) fn admit(&mut self, header: &Packet) -> ReceiveResult<StreamId> {
        let key = header.key();
        if self.by_key.contains_key(&key) {
            return Err(ReceiveError::DuplicateStream(key));
        }
        let id = StreamId(self.next_id);
        let stream = Stream::new(id, header)?;
        self.next_id += 1;
        self.by_key.insert(key, id);
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Remove a stream. Only the deferred-delete drain calls this.
    pub(crate) fn reclaim(&mut self, id: StreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        self.by_key.remove(&stream.key());
        Some(stream)
    }

    /// Stream currently serving `key`.
    pub fn id_for(&self, key: &ConversationKey) -> Option<StreamId> {
        self.by_key.get(key).copied()
    }

    /// Look up a stream.
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Key and header of a message stream waiting for a posted receive.
    pub fn pending_match(&self, id: StreamId) -> Option<(ConversationKey, MessageHeader)> {
        let stream = self.streams.get(&id)?;
        stream.pending_match().map(|header| (stream.key(), header))
    }

    /// Number of streams in the table.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the table holds no stream.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{NodeId, Pid, RdmaHeader, RdmaOp, ShmemHeader, ShmemOp};

    fn key(node: u32) -> ConversationKey {
        ConversationKey::new(NodeId(node), Pid(1), Pid(0))
    }

    fn message_header(node: u32) -> Packet {
        let header = MessageHeader {
            tag: 0,
            scope: 0,
            length: 0,
        };
        Packet::message_header(key(node), header, Vec::new())
    }

    #[test]
    fn variant_follows_header_opcode() {
        let mut table = StreamTable::new();
        let rdma = RdmaHeader {
            op: RdmaOp::Put,
            region: 0,
            offset: 0,
            length: 0,
            resp_key: 0,
        };
        let shmem = ShmemHeader {
            op: ShmemOp::Ack,
            addr: 0,
            length: 0,
            operand: 0,
            compare: 0,
            resp_key: 0,
        };

        let m = table.admit(&message_header(1)).expect("message");
        let r = table
            .admit(&Packet::rdma_header(key(2), rdma, Vec::new()))
            .expect("rdma");
        let s = table
            .admit(&Packet::shmem_header(key(3), shmem, Vec::new()))
            .expect("shmem");

        assert_eq!(table.get(m).map(Stream::kind), Some(StreamKind::Message));
        assert_eq!(table.get(r).map(Stream::kind), Some(StreamKind::Rdma));
        assert_eq!(table.get(s).map(Stream::kind), Some(StreamKind::Shmem));
        assert_eq!(table.get(m).map(Stream::state), Some(StreamState::AwaitingHeader));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn one_stream_per_key() {
        let mut table = StreamTable::new();
        let first = table.admit(&message_header(1)).expect("first");
        assert_eq!(
            table.admit(&message_header(1)),
            Err(ReceiveError::DuplicateStream(key(1)))
        );

        let reclaimed = table.reclaim(first).expect("reclaim");
        assert_eq!(reclaimed.key(), key(1));
        assert_eq!(table.id_for(&key(1)), None);

        let second = table.admit(&message_header(1)).expect("second");
        assert_ne!(first, second);
    }

    #[test]
    fn body_packet_cannot_open_a_stream() {
        let mut table = StreamTable::new();
        let body = Packet::body(key(4), 1, vec![1]);
        assert_eq!(
            table.admit(&body),
            Err(ReceiveError::BodyBeforeHeader(key(4)))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn fresh_stream_is_not_blocked() {
        let mut table = StreamTable::new();
        let id = table.admit(&message_header(1)).expect("admit");
        let stream = table.get(id).expect("stream");
        assert!(!stream.is_blocked(1));
        assert_eq!(stream.pending_operations(), 0);
        assert_eq!(table.pending_match(id), None);
    }
}
