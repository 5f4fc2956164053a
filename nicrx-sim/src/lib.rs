//! # nicrx-sim
//!
//! Deterministic discrete-event harness for the [`nicrx`] receive engine.
//!
//! A [`SimWorld`] owns logical time and an ordered event queue. A
//! [`SimCluster`] wires one [`nicrx::ReceiveScheduler`] per simulated node
//! to that world through [`SimProviders`], which turn every collaborator
//! call into recorded state or a future event:
//!
//! - packets injected with a sampled link latency become
//!   [`Event::PacketArrival`]
//! - `schedule_tick` and `schedule_callback` become [`Event::Tick`] and
//!   [`Event::MemoryComplete`]
//! - completions, need-receive notices, responses and telemetry are kept
//!   per node for inspection
//!
//! All randomness comes from one seeded thread-local generator ([`rng`]), so
//! a seed reproduces a run exactly. [`always_assert!`] and
//! [`sometimes_assert!`] check invariants while the simulation runs.
//!
//! ## Example
//!
//! ```rust
//! use nicrx::{ConversationKey, MatchSpec, MessageHeader, NodeId, Packet, Pid, PostedReceive, ReceiveConfig};
//! use nicrx_sim::SimCluster;
//!
//! let mut cluster = SimCluster::single(ReceiveConfig::default(), 42).expect("valid config");
//! let node = NodeId(0);
//! cluster
//!     .post_receive(node, Pid(0), PostedReceive::new(MatchSpec::any(0), 8, 1))
//!     .expect("post");
//!
//! let key = ConversationKey::new(NodeId(7), Pid(0), Pid(0));
//! let header = MessageHeader { tag: 1, scope: 0, length: 2 };
//! cluster
//!     .inject(node, Packet::message_header(key, header, vec![1, 2]).tail())
//!     .expect("inject");
//! cluster.run_until_empty().expect("run");
//!
//! assert_eq!(cluster.completions(node).expect("node").len(), 1);
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod assertions;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod providers;
pub mod rng;
pub mod workload;
pub mod world;

pub use assertions::{
    get_assertion_results, reset_assertion_results, validate_assertion_contracts, AssertionStats,
};
pub use cluster::{SimCluster, SimEngine};
pub use config::{AccessCost, LatencyRange, LinkConfiguration, MemoryTiming};
pub use error::{SimError, SimResult};
pub use events::{Event, EventQueue, ScheduledEvent};
pub use providers::SimProviders;
pub use rng::{
    get_current_sim_seed, reset_sim_rng, set_sim_seed, sim_random, sim_random_range, sim_shuffle,
};
pub use workload::{TrafficPlan, TrafficWorkload, WorkloadReport};
pub use world::{NodeTelemetry, SimWorld, WeakSimWorld};
