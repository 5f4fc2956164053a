//! # nicrx
//!
//! Receive-side engine of a simulated network interface controller.
//!
//! The engine pulls packets from a network link, demultiplexes them into
//! per-conversation streams, matches message headers against receives posted
//! by the host, and applies RDMA and shared-memory operations to registered
//! memory. It enforces two admission limits (active streams and buffered
//! packets) and never drops a packet: anything that cannot proceed stays
//! buffered for a later pass.
//!
//! ## Collaborators
//!
//! The engine is generic over a [`NicProviders`] bundle and never owns a
//! clock, a link or a host:
//!
//! - [`NetworkLink`]: pull-based packet source with a one-shot wake-up
//! - [`EngineClock`]: schedules passes and memory-access continuations
//! - [`HostMemoryModel`]: delay model for host and NIC memory traffic
//! - [`HostInterface`]: need-receive notices and completions
//! - [`Transmit`]: responses generated on receive
//! - [`Telemetry`]: fire-and-forget samples
//!
//! ## Flow of control
//!
//! Single threaded and cooperative. The external scheduler calls
//! [`ReceiveScheduler::tick`] and [`ReceiveScheduler::on_memory_complete`];
//! the host calls [`ReceiveScheduler::post_receive`] and the registration
//! methods. Collaborators never call back into the engine synchronously.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Engine configuration.
pub mod config;
/// Per-process receive state.
pub mod context;
/// Error types.
pub mod error;
/// Registered memory and the shared heap.
pub mod memory;
/// Engine counters.
pub mod metrics;
/// Packet model.
pub mod packet;
/// Collaborator traits.
pub mod providers;
mod scheduler;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{DuplicateRegistrationPolicy, ReceiveConfig, SequencePolicy};
pub use context::{MatchSpec, PostOutcome, PostedReceive, ReceiveContext};
pub use error::{ConfigError, ReceiveError, ReceiveResult};
pub use memory::{MemoryRegion, RdmaOrigin, SharedHeap};
pub use metrics::ReceiveMetrics;
pub use packet::{
    ControlKind, ConversationKey, MessageHeader, NodeId, Opcode, Packet, Pid, RdmaHeader, RdmaOp,
    Response, ShmemHeader, ShmemOp,
};
pub use providers::{
    Completion, EngineClock, HostInterface, HostMemoryModel, NeedReceive, NetworkLink,
    NicProviders, Telemetry, TelemetrySample, Transmit,
};
pub use scheduler::ReceiveScheduler;
pub use stream::{MemoryAccess, MemoryToken, Stream, StreamId, StreamKind, StreamState, StreamTable};
