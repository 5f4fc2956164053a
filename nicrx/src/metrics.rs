//! Counters kept by the engine alongside the telemetry samples it emits.

/// Running counters for one engine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveMetrics {
    /// Packets pulled from the link
    pub packets_received: u64,

    /// Payload bytes pulled from the link
    pub bytes_received: u64,

    /// Control packets consumed
    pub control_packets: u64,

    /// Streams admitted
    pub streams_created: u64,

    /// Streams that reached completion
    pub streams_completed: u64,

    /// Streams reclaimed by the deferred-delete drain
    pub streams_reclaimed: u64,

    /// Headers that had to wait for a posted receive
    pub receives_needed: u64,

    /// Times a header stayed queued because the stream budget was spent
    pub admission_stalls: u64,

    /// Out-of-sequence packets absorbed by a lenient policy
    pub sequence_anomalies: u64,

    /// Responses handed to the transmitter
    pub responses_sent: u64,

    /// Highest number of simultaneously active streams
    pub peak_active_streams: usize,

    /// Highest number of buffered packets
    pub peak_pending_packets: usize,
}

impl ReceiveMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet pulled from the link.
    pub fn record_packet(&mut self, bytes: usize, pending_packets: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
        self.peak_pending_packets = self.peak_pending_packets.max(pending_packets);
    }

    /// Record a stream admission.
    pub fn record_admission(&mut self, active_streams: usize) {
        self.streams_created += 1;
        self.peak_active_streams = self.peak_active_streams.max(active_streams);
    }

    /// Record a header left queued for lack of stream budget.
    pub fn record_admission_stall(&mut self) {
        self.admission_stalls += 1;
    }

    /// Record a consumed control packet.
    pub fn record_control(&mut self) {
        self.control_packets += 1;
    }

    /// Record a stream reaching completion.
    pub fn record_completion(&mut self) {
        self.streams_completed += 1;
    }

    /// Record a stream leaving the table.
    pub fn record_reclaim(&mut self) {
        self.streams_reclaimed += 1;
    }

    /// Record a header that found no posted receive.
    pub fn record_need_receive(&mut self) {
        self.receives_needed += 1;
    }

    /// Record an out-of-sequence packet.
    pub fn record_sequence_anomaly(&mut self) {
        self.sequence_anomalies += 1;
    }

    /// Record a response handed to the transmitter.
    pub fn record_response(&mut self) {
        self.responses_sent += 1;
    }
}
