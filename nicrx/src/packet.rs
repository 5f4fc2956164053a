//! Logical packet model consumed by the receive engine.
//!
//! Only the fields the engine reads are modeled here. The on-wire byte layout
//! belongs to the send side and the link, not to this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a simulated node on the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Identifier of a process (virtual NIC endpoint) on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u16);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// Identity of one logical conversation.
///
/// At most one stream is active per key at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Node the packets come from
    pub source_node: NodeId,
    /// Process on the source node
    pub source_pid: Pid,
    /// Local destination process
    pub dest_pid: Pid,
}

impl ConversationKey {
    /// Create a key from its three components.
    pub fn new(source_node: NodeId, source_pid: Pid, dest_pid: Pid) -> Self {
        Self {
            source_node,
            source_pid,
            dest_pid,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}->{}",
            self.source_node, self.source_pid, self.dest_pid
        )
    }
}

/// Header of an ordinary tagged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Application tag used for matching
    pub tag: u32,
    /// Communicator-like matching scope
    pub scope: u32,
    /// Total message length announced by the sender
    pub length: usize,
}

/// RDMA operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RdmaOp {
    /// Push data into a registered memory region
    Put,
    /// Pull request for data from a registered memory region
    Get,
    /// Data answering an earlier get issued by this node
    GetResp,
}

/// Header of an RDMA conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaHeader {
    /// Operation
    pub op: RdmaOp,
    /// Memory region number on the target process
    pub region: u16,
    /// Byte offset inside the region
    pub offset: usize,
    /// Bytes requested (get) or carried (put, get response)
    pub length: usize,
    /// Correlation key of the origin waiting for a get response
    pub resp_key: u16,
}

/// Shared-memory operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShmemOp {
    /// Write bytes into the shared heap
    Put,
    /// Read bytes from the shared heap
    Get,
    /// Data answering a get or a fetching atomic
    GetResp,
    /// Atomic add returning the previous value
    FetchAdd,
    /// Atomic add without a returned value
    Add,
    /// Atomic compare-and-swap returning the previous value
    CompareSwap,
    /// Atomic swap returning the previous value
    Swap,
    /// Acknowledgement of a remote put or add
    Ack,
}

impl ShmemOp {
    /// Whether this op executes against the heap after a NIC access delay.
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            ShmemOp::FetchAdd | ShmemOp::Add | ShmemOp::CompareSwap | ShmemOp::Swap
        )
    }
}

/// Header of a shared-memory conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmemHeader {
    /// Operation
    pub op: ShmemOp,
    /// Heap address on the target process
    pub addr: usize,
    /// Length in bytes of the data moved
    pub length: usize,
    /// Atomic operand (addend, swap value, new value for compare-and-swap)
    pub operand: u64,
    /// Comparand for compare-and-swap
    pub compare: u64,
    /// Correlation key of the origin waiting for a response
    pub resp_key: u16,
}

/// Flow-control payload of a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    /// Link-level acknowledgement
    Ack,
    /// Credit return
    Credit(u32),
}

/// Per-packet operation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Body or tail packet, meaning comes from the stream's header
    Data,
    /// Message header
    Message(MessageHeader),
    /// RDMA header
    Rdma(RdmaHeader),
    /// Shared-memory header
    Shmem(ShmemHeader),
    /// Control packet
    Control(ControlKind),
}

/// A packet as seen by the receive engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Sending node
    pub source_node: NodeId,
    /// Sending process
    pub source_pid: Pid,
    /// Local destination process
    pub dest_pid: Pid,
    /// First packet of a conversation
    pub is_header: bool,
    /// Last packet of a conversation
    pub is_tail: bool,
    /// Flow-control packet exempt from stream admission
    pub is_control: bool,
    /// Position inside the conversation, starting at the header
    pub sequence: u32,
    /// Operation descriptor
    pub opcode: Opcode,
    /// Number of payload bytes
    pub payload_size: usize,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Packet {
    fn new(key: ConversationKey, opcode: Opcode, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            source_node: key.source_node,
            source_pid: key.source_pid,
            dest_pid: key.dest_pid,
            is_header: false,
            is_tail: false,
            is_control: false,
            sequence,
            opcode,
            payload_size: payload.len(),
            payload,
        }
    }

    /// Header packet of a tagged message, carrying the first payload bytes.
    pub fn message_header(key: ConversationKey, header: MessageHeader, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(key, Opcode::Message(header), 0, payload);
        packet.is_header = true;
        packet
    }

    /// Header packet of an RDMA conversation.
    pub fn rdma_header(key: ConversationKey, header: RdmaHeader, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(key, Opcode::Rdma(header), 0, payload);
        packet.is_header = true;
        packet
    }

    /// Header packet of a shared-memory conversation.
    pub fn shmem_header(key: ConversationKey, header: ShmemHeader, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(key, Opcode::Shmem(header), 0, payload);
        packet.is_header = true;
        packet
    }

    /// Body packet following a header.
    pub fn body(key: ConversationKey, sequence: u32, payload: Vec<u8>) -> Self {
        Self::new(key, Opcode::Data, sequence, payload)
    }

    /// Control packet.
    pub fn control(key: ConversationKey, kind: ControlKind) -> Self {
        let mut packet = Self::new(key, Opcode::Control(kind), 0, Vec::new());
        packet.is_control = true;
        packet
    }

    /// Mark this packet as the last of its conversation.
    pub fn tail(mut self) -> Self {
        self.is_tail = true;
        self
    }

    /// Conversation this packet belongs to.
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.source_node, self.source_pid, self.dest_pid)
    }
}

/// Outbound packet generated by the receive side (get responses, acks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Node the response goes to
    pub dest_node: NodeId,
    /// Process on that node
    pub dest_pid: Pid,
    /// Local process answering
    pub source_pid: Pid,
    /// Header describing the response
    pub opcode: Opcode,
    /// Response data
    pub payload: Vec<u8>,
}
