//! Errors of the simulation harness.

use nicrx::{ConfigError, NodeId, ReceiveError};
use thiserror::Error;

/// Errors raised while driving a simulated cluster.
#[derive(Debug, Error)]
pub enum SimError {
    /// The simulation world has been dropped.
    #[error("simulation has been shut down")]
    SimulationShutdown,

    /// An event or call named a node the cluster does not have.
    #[error("no simulated node {0}")]
    UnknownNode(NodeId),

    /// A receive engine returned an error.
    #[error("engine on {node} failed: {source}")]
    Engine {
        /// Node whose engine failed
        node: NodeId,
        /// Error returned by the engine
        #[source]
        source: ReceiveError,
    },

    /// An engine configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A type alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;
