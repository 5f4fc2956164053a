use thiserror::Error;

use crate::packet::{ConversationKey, Pid};

/// Errors raised by the receive engine.
///
/// Every variant except [`ReceiveError::DuplicateRegistration`] is fatal: the
/// engine records it and refuses any further work with
/// [`ReceiveError::Faulted`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    /// The active stream counter would go below zero.
    #[error("active stream count underflow")]
    StreamCountUnderflow,

    /// A packet or host call named a process this engine does not serve.
    #[error("no receive context for {0}")]
    UnknownProcess(Pid),

    /// A stream was admitted for a key that already has one.
    #[error("stream already active for {0}")]
    DuplicateStream(ConversationKey),

    /// A packet arrived out of sequence under the fail-fast policy.
    #[error("sequence gap on {key}: expected {expected}, got {got}")]
    SequenceGap {
        /// Conversation the packet belongs to
        key: ConversationKey,
        /// Sequence number the stream was waiting for
        expected: u32,
        /// Sequence number carried by the packet
        got: u32,
    },

    /// A body or tail packet arrived with no stream and no header.
    #[error("body packet before header on {0}")]
    BodyBeforeHeader(ConversationKey),

    /// A context was torn down while still holding state.
    #[error(
        "{pid} torn down with {posted} posted receives, {blocked} blocked streams, \
         {regions} memory regions, {origins} rdma origins"
    )]
    TeardownLeak {
        /// Process whose context leaked
        pid: Pid,
        /// Outstanding posted receives
        posted: usize,
        /// Streams still waiting for a receive
        blocked: usize,
        /// Registered memory regions
        regions: usize,
        /// Registered rdma origins
        origins: usize,
    },

    /// An RDMA header named an unregistered memory region.
    #[error("{pid} has no memory region {region}")]
    UnknownRegion {
        /// Target process
        pid: Pid,
        /// Region number
        region: u16,
    },

    /// A response named an unregistered origin key.
    #[error("{pid} has no rdma origin {key}")]
    UnknownOrigin {
        /// Target process
        pid: Pid,
        /// Correlation key
        key: u16,
    },

    /// An access fell outside a region or the shared heap.
    #[error("access of {len} bytes at {offset} exceeds {capacity} bytes on {key}")]
    OutOfBounds {
        /// Conversation that issued the access
        key: ConversationKey,
        /// First byte accessed
        offset: usize,
        /// Bytes accessed
        len: usize,
        /// Size of the target memory
        capacity: usize,
    },

    /// A continuation named a stream that no longer exists.
    #[error("no stream with id {0}")]
    UnknownStream(u64),

    /// A registration key was reused under the reject policy.
    #[error("{pid} already has a registration under key {key}")]
    DuplicateRegistration {
        /// Target process
        pid: Pid,
        /// Reused key
        key: u16,
    },

    /// The engine hit a fatal error earlier and no longer accepts work.
    #[error("engine faulted: {0}")]
    Faulted(String),
}

impl ReceiveError {
    /// Whether this error terminates the engine instance.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReceiveError::DuplicateRegistration { .. })
    }
}

/// A type alias for `Result<T, ReceiveError>`.
pub type ReceiveResult<T> = Result<T, ReceiveError>;

/// Errors found while validating or loading a [`crate::ReceiveConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A limit that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    /// The configuration text could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
