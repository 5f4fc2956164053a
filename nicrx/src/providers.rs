//! Collaborator traits and the provider bundle the engine is generic over.
//!
//! The engine never owns a clock, a link or a host. It talks to them through
//! the traits below, bundled into a single [`NicProviders`] type parameter.
//! Implementations are cheap handles (typically `Rc<RefCell<_>>` inside) so
//! every method takes `&self`.
//!
//! Collaborators must not call back into the engine synchronously. Re-entry
//! happens only through [`EngineClock`] (a later `tick` or
//! `on_memory_complete`) or through the one-shot link notification.

use std::time::Duration;

use crate::packet::{ControlKind, NodeId, Packet, Pid, Response, ShmemOp};
use crate::stream::MemoryToken;

/// Inbound side of the network link, pull based.
pub trait NetworkLink {
    /// Take the next packet waiting on virtual channel `vc`.
    fn receive(&self, vc: usize) -> Option<Packet>;

    /// Whether a packet is waiting on `vc`.
    fn request_to_receive(&self, vc: usize) -> bool;

    /// Arm a one-shot wake-up for the next arrival on `vc`.
    ///
    /// The link calls `ReceiveScheduler::on_network_ready` once and then
    /// forgets the subscription.
    fn set_notify(&self, vc: usize);
}

/// Scheduling entry points of the external discrete-event scheduler.
pub trait EngineClock {
    /// Run `ReceiveScheduler::tick` after `delay`.
    fn schedule_tick(&self, delay: Duration);

    /// Run `ReceiveScheduler::on_memory_complete(token)` after `delay`.
    fn schedule_callback(&self, delay: Duration, token: MemoryToken);
}

/// Cost model for memory traffic caused by received packets.
pub trait HostMemoryModel {
    /// Time to read `bytes` from host memory.
    fn host_read_delay(&self, bytes: usize) -> Duration;

    /// Time to write `bytes` into host memory.
    fn host_write_delay(&self, bytes: usize) -> Duration;

    /// Time for the NIC to touch its own memory (translation, atomics).
    fn nic_access_delay(&self, bytes: usize) -> Duration;
}

/// Notification that a header found no posted receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedReceive {
    /// Local process the message is for
    pub pid: Pid,
    /// Sending node
    pub source_node: NodeId,
    /// Sending process
    pub source_pid: Pid,
    /// Message tag
    pub tag: u32,
    /// Announced length, a sizing hint for the host buffer
    pub length: usize,
}

/// Work finished on behalf of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A tagged message landed in a posted receive.
    Message {
        /// Receiving process
        pid: Pid,
        /// Cookie of the posted receive that matched
        cookie: u64,
        /// Sending node
        source_node: NodeId,
        /// Sending process
        source_pid: Pid,
        /// Message tag
        tag: u32,
        /// Bytes the sender transferred
        length: usize,
        /// Bytes stored in the receive buffer
        data: Vec<u8>,
        /// The sender overran the receive buffer
        truncated: bool,
    },
    /// An RDMA put finished writing into a memory region.
    RdmaPut {
        /// Target process
        pid: Pid,
        /// Region written
        region: u16,
        /// First byte written
        offset: usize,
        /// Bytes written
        length: usize,
    },
    /// An RDMA get was served and its response handed to the transmitter.
    RdmaGetServed {
        /// Target process
        pid: Pid,
        /// Region read
        region: u16,
        /// Bytes returned
        length: usize,
    },
    /// Response data for an earlier get landed in its origin buffer.
    OriginFilled {
        /// Process that issued the get
        pid: Pid,
        /// Correlation key
        key: u16,
        /// Cookie of the origin registration
        cookie: u64,
        /// Response data
        data: Vec<u8>,
    },
    /// A shared-memory operation executed against the local heap.
    Shmem {
        /// Target process
        pid: Pid,
        /// Operation
        op: ShmemOp,
        /// Heap address
        addr: usize,
        /// Value found before an atomic executed
        previous: Option<u64>,
    },
    /// A remote peer acknowledged a shared-memory put or add.
    ShmemAck {
        /// Process the acknowledgement is for
        pid: Pid,
        /// Acknowledging node
        source_node: NodeId,
        /// Correlation key echoed by the peer
        key: u16,
    },
    /// A control packet was consumed.
    Control {
        /// Destination process
        pid: Pid,
        /// Sending node
        source_node: NodeId,
        /// Control payload
        kind: ControlKind,
    },
}

/// Host/application side of the engine.
pub trait HostInterface {
    /// A header is waiting for a matching `post_receive`.
    fn need_receive(&self, notice: NeedReceive);

    /// A stream or control packet finished.
    fn complete(&self, completion: Completion);
}

/// Send side hook used for responses generated on receive.
pub trait Transmit {
    /// Hand a response to the send machinery.
    fn send(&self, response: Response);
}

/// Fire-and-forget telemetry samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySample {
    /// One packet pulled from the link
    PacketReceived {
        /// Payload bytes
        bytes: usize,
    },
    /// Streams active at the end of a pass
    ActiveStreams(usize),
    /// Packets buffered at the end of a pass
    PendingPackets(usize),
    /// A packet arrived out of sequence and a lenient policy absorbed it
    SequenceAnomaly,
}

/// Telemetry collector.
pub trait Telemetry {
    /// Record a sample.
    fn record(&self, sample: TelemetrySample);
}

/// Bundle of every collaborator the engine needs.
pub trait NicProviders: Clone + 'static {
    /// Inbound link.
    type Link: NetworkLink;
    /// Scheduler entry points.
    type Clock: EngineClock;
    /// Memory cost model.
    type Memory: HostMemoryModel;
    /// Host notifications.
    type Host: HostInterface;
    /// Response transmitter.
    type Transmit: Transmit;
    /// Telemetry collector.
    type Telemetry: Telemetry;

    /// Get the link.
    fn link(&self) -> &Self::Link;
    /// Get the clock.
    fn clock(&self) -> &Self::Clock;
    /// Get the memory model.
    fn memory(&self) -> &Self::Memory;
    /// Get the host.
    fn host(&self) -> &Self::Host;
    /// Get the transmitter.
    fn transmit(&self) -> &Self::Transmit;
    /// Get the telemetry collector.
    fn telemetry(&self) -> &Self::Telemetry;
}
