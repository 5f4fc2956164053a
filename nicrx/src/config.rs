//! Engine configuration.
//!
//! | Field | Default | Effect |
//! |-------|---------|--------|
//! | `num_processes` | 1 | Receive contexts created at construction |
//! | `rx_channel` | 0 | Link virtual channel the engine pulls from |
//! | `max_active_streams` | 32 | Streams admitted concurrently |
//! | `max_pending_packets` | 64 | Packets buffered but not yet consumed |
//! | `max_queue_depth` | 8 | Host operations in flight per stream before it blocks |
//! | `tick_interval` | 1ns | Delay before a rescheduled processing pass |
//! | `shmem_heap_bytes` | 64KiB | Shared heap per process |
//! | `sequence_policy` | `FailFast` | Reaction to out-of-sequence packets |
//! | `duplicate_registration` | `Overwrite` | Reaction to a reused registration key |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Reaction to a packet whose sequence number is not the one expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SequencePolicy {
    /// Fault the engine
    #[default]
    FailFast,
    /// Accept the packet and continue from its sequence number
    Resync,
    /// Drop the packet and keep waiting for the expected one
    Discard,
}

/// Reaction to a registration under a key already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicateRegistrationPolicy {
    /// Last write wins
    #[default]
    Overwrite,
    /// Refuse the new registration
    Reject,
}

/// Configuration of one receive engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Number of local processes sharing this NIC
    pub num_processes: u16,
    /// Virtual channel packets are pulled from
    pub rx_channel: usize,
    /// Upper bound on concurrently active streams
    pub max_active_streams: usize,
    /// Upper bound on buffered packets
    pub max_pending_packets: usize,
    /// Host operations in flight per stream before it reports blocked
    pub max_queue_depth: usize,
    /// Delay before a rescheduled processing pass
    pub tick_interval: Duration,
    /// Size of each process's shared heap
    pub shmem_heap_bytes: usize,
    /// Sequence gap handling
    pub sequence_policy: SequencePolicy,
    /// Registration key reuse handling
    pub duplicate_registration: DuplicateRegistrationPolicy,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            num_processes: 1,
            rx_channel: 0,
            max_active_streams: 32,
            max_pending_packets: 64,
            max_queue_depth: 8,
            tick_interval: Duration::from_nanos(1),
            shmem_heap_bytes: 64 * 1024,
            sequence_policy: SequencePolicy::FailFast,
            duplicate_registration: DuplicateRegistrationPolicy::Overwrite,
        }
    }
}

impl ReceiveConfig {
    /// Parse a JSON document, filling unspecified fields with defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_processes == 0 {
            return Err(ConfigError::ZeroLimit("num_processes"));
        }
        if self.max_active_streams == 0 {
            return Err(ConfigError::ZeroLimit("max_active_streams"));
        }
        if self.max_pending_packets == 0 {
            return Err(ConfigError::ZeroLimit("max_pending_packets"));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::ZeroLimit("max_queue_depth"));
        }
        Ok(())
    }

    /// Set the number of local processes.
    pub fn with_processes(mut self, num_processes: u16) -> Self {
        self.num_processes = num_processes;
        self
    }

    /// Set the stream and packet admission limits.
    pub fn with_limits(mut self, max_active_streams: usize, max_pending_packets: usize) -> Self {
        self.max_active_streams = max_active_streams;
        self.max_pending_packets = max_pending_packets;
        self
    }

    /// Set the per-stream host queue depth.
    pub fn with_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the shared heap size.
    pub fn with_shmem_heap(mut self, bytes: usize) -> Self {
        self.shmem_heap_bytes = bytes;
        self
    }

    /// Set the sequence gap policy.
    pub fn with_sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.sequence_policy = policy;
        self
    }

    /// Set the duplicate registration policy.
    pub fn with_duplicate_registration(mut self, policy: DuplicateRegistrationPolicy) -> Self {
        self.duplicate_registration = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ReceiveConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = ReceiveConfig::default().with_limits(0, 4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit("max_active_streams"))
        ));

        let config = ReceiveConfig::default().with_queue_depth(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit("max_queue_depth"))
        ));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = ReceiveConfig::from_json_str(
            r#"{ "num_processes": 4, "max_active_streams": 2, "sequence_policy": "Resync" }"#,
        )
        .expect("valid config");

        assert_eq!(config.num_processes, 4);
        assert_eq!(config.max_active_streams, 2);
        assert_eq!(config.max_pending_packets, 64);
        assert_eq!(config.sequence_policy, SequencePolicy::Resync);
        assert_eq!(
            config.duplicate_registration,
            DuplicateRegistrationPolicy::Overwrite
        );
    }

    #[test]
    fn json_with_zero_limit_fails_validation() {
        let result = ReceiveConfig::from_json_str(r#"{ "max_pending_packets": 0 }"#);
        assert!(matches!(result, Err(ConfigError::ZeroLimit(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = ReceiveConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
