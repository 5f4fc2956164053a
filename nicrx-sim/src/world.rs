//! Simulation world: logical time, the event queue and per-node link state.
//!
//! The world never owns an engine. It hands events back to the
//! [`crate::SimCluster`] that drives the engines, and keeps what the
//! simulated links and hosts observe (inbound packets, notifications,
//! completions, responses) in one `Rc<RefCell<_>>` shared with the
//! providers through [`WeakSimWorld`] handles.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use nicrx::{Completion, NeedReceive, NodeId, Packet, Response, TelemetrySample};
use tracing::{instrument, trace};

use crate::assertions::reset_assertion_results;
use crate::error::{SimError, SimResult};
use crate::events::{Event, EventQueue, ScheduledEvent};
use crate::rng::{reset_sim_rng, set_sim_seed};

/// Telemetry samples folded into running totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTelemetry {
    /// Packets pulled by the engine
    pub packets: u64,
    /// Payload bytes pulled by the engine
    pub bytes: u64,
    /// Last active-stream sample
    pub active_streams: usize,
    /// Last pending-packet sample
    pub pending_packets: usize,
    /// Out-of-sequence packets absorbed
    pub sequence_anomalies: u64,
}

impl NodeTelemetry {
    fn record(&mut self, sample: TelemetrySample) {
        match sample {
            TelemetrySample::PacketReceived { bytes } => {
                self.packets += 1;
                self.bytes += bytes as u64;
            }
            TelemetrySample::ActiveStreams(n) => self.active_streams = n,
            TelemetrySample::PendingPackets(n) => self.pending_packets = n,
            TelemetrySample::SequenceAnomaly => self.sequence_anomalies += 1,
        }
    }
}

/// What one simulated node's link and host have seen.
#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub(crate) channel: usize,
    pub(crate) inbound: VecDeque<Packet>,
    pub(crate) notify_armed: bool,
    /// Latest arrival time scheduled for this node.
    pub(crate) last_arrival: Duration,
    pub(crate) completions: Vec<Completion>,
    pub(crate) needs: Vec<NeedReceive>,
    pub(crate) responses: Vec<Response>,
    pub(crate) telemetry: NodeTelemetry,
}

impl NodeState {
    pub(crate) fn record_telemetry(&mut self, sample: TelemetrySample) {
        self.telemetry.record(sample);
    }
}

#[derive(Debug)]
pub(crate) struct SimInner {
    pub(crate) current_time: Duration,
    pub(crate) event_queue: EventQueue,
    pub(crate) next_sequence: u64,
    pub(crate) events_processed: u64,
    pub(crate) nodes: Vec<NodeState>,
}

impl SimInner {
    fn node_mut(&mut self, node: NodeId) -> SimResult<&mut NodeState> {
        self.nodes
            .get_mut(node.0 as usize)
            .ok_or(SimError::UnknownNode(node))
    }

    fn node(&self, node: NodeId) -> SimResult<&NodeState> {
        self.nodes
            .get(node.0 as usize)
            .ok_or(SimError::UnknownNode(node))
    }

    fn schedule_at(&mut self, event: Event, time: Duration) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.event_queue
            .schedule(ScheduledEvent::new(time, event, sequence));
    }
}

/// Central owner of simulated time and node state.
#[derive(Debug)]
pub struct SimWorld {
    pub(crate) inner: Rc<RefCell<SimInner>>,
}

impl SimWorld {
    /// Create a world with `nodes` nodes, each receiving on `channel`.
    ///
    /// Reseeds the thread-local RNG and clears assertion results, so
    /// consecutive simulations on one thread do not leak state.
    pub fn new_with_seed(nodes: usize, channel: usize, seed: u64) -> Self {
        reset_sim_rng();
        set_sim_seed(seed);
        reset_assertion_results();

        let nodes = (0..nodes)
            .map(|_| NodeState {
                channel,
                ..NodeState::default()
            })
            .collect();
        Self {
            inner: Rc::new(RefCell::new(SimInner {
                current_time: Duration::ZERO,
                event_queue: EventQueue::new(),
                next_sequence: 0,
                events_processed: 0,
                nodes,
            })),
        }
    }

    /// Pop the next event and advance time to it.
    #[instrument(skip(self))]
    pub fn next_event(&self) -> Option<Event> {
        let mut inner = self.inner.borrow_mut();
        let scheduled = inner.event_queue.pop_earliest()?;
        inner.current_time = scheduled.time();
        inner.events_processed += 1;
        Some(scheduled.into_event())
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.inner.borrow().current_time
    }

    /// Schedule `event` after `delay`.
    pub fn schedule_event(&self, event: Event, delay: Duration) {
        let mut inner = self.inner.borrow_mut();
        let at = inner.current_time + delay;
        inner.schedule_at(event, at);
    }

    /// Schedule `event` at an absolute time.
    pub fn schedule_event_at(&self, event: Event, time: Duration) {
        self.inner.borrow_mut().schedule_at(event, time);
    }

    /// Schedule the arrival of `packet` at `node` after `latency`.
    ///
    /// Arrivals at one node never overtake each other: a packet drawing a
    /// shorter latency than its predecessor lands right after it.
    pub fn schedule_arrival(&self, node: NodeId, packet: Packet, latency: Duration) -> SimResult<Duration> {
        let mut inner = self.inner.borrow_mut();
        let earliest = inner.current_time + latency;
        let state = inner.node_mut(node)?;
        let at = earliest.max(state.last_arrival);
        state.last_arrival = at;
        inner.schedule_at(Event::PacketArrival { node, packet }, at);
        Ok(at)
    }

    /// Put `packet` on the receive link of `node`.
    ///
    /// Returns `true` when the engine had armed its wake-up, which is
    /// consumed.
    pub fn deliver(&self, node: NodeId, packet: Packet) -> SimResult<bool> {
        let mut inner = self.inner.borrow_mut();
        let state = inner.node_mut(node)?;
        trace!(%node, key = %packet.key(), sequence = packet.sequence, "Packet delivered to link");
        state.inbound.push_back(packet);
        Ok(std::mem::take(&mut state.notify_armed))
    }

    pub(crate) fn with_node<R>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut NodeState) -> R,
    ) -> SimResult<R> {
        let mut inner = self.inner.borrow_mut();
        Ok(f(inner.node_mut(node)?))
    }

    /// Completions reported to the host of `node`.
    pub fn completions(&self, node: NodeId) -> SimResult<Vec<Completion>> {
        Ok(self.inner.borrow().node(node)?.completions.clone())
    }

    /// Need-receive notices reported to the host of `node`.
    pub fn needs(&self, node: NodeId) -> SimResult<Vec<NeedReceive>> {
        Ok(self.inner.borrow().node(node)?.needs.clone())
    }

    /// Responses transmitted by `node`.
    pub fn responses(&self, node: NodeId) -> SimResult<Vec<Response>> {
        Ok(self.inner.borrow().node(node)?.responses.clone())
    }

    /// Telemetry totals of `node`.
    pub fn telemetry(&self, node: NodeId) -> SimResult<NodeTelemetry> {
        Ok(self.inner.borrow().node(node)?.telemetry.clone())
    }

    /// Packets waiting on the receive link of `node`.
    pub fn inbound_len(&self, node: NodeId) -> SimResult<usize> {
        Ok(self.inner.borrow().node(node)?.inbound.len())
    }

    /// Creates a weak reference to this simulation world.
    pub fn downgrade(&self) -> WeakSimWorld {
        WeakSimWorld {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Returns `true` if there are events waiting to be processed.
    pub fn has_pending_events(&self) -> bool {
        !self.inner.borrow().event_queue.is_empty()
    }

    /// Returns the number of events waiting to be processed.
    pub fn pending_event_count(&self) -> usize {
        self.inner.borrow().event_queue.len()
    }

    /// Number of events processed so far.
    pub fn events_processed(&self) -> u64 {
        self.inner.borrow().events_processed
    }
}

/// A weak reference to a simulation world.
///
/// Held by providers so they never keep the world alive. Every operation
/// fails with [`SimError::SimulationShutdown`] once the world is dropped.
#[derive(Debug, Clone)]
pub struct WeakSimWorld {
    inner: Weak<RefCell<SimInner>>,
}

impl WeakSimWorld {
    /// Attempts to upgrade this weak reference to a strong reference.
    pub fn upgrade(&self) -> SimResult<SimWorld> {
        self.inner
            .upgrade()
            .map(|inner| SimWorld { inner })
            .ok_or(SimError::SimulationShutdown)
    }

    /// Schedules an event to execute after `delay`.
    pub fn schedule_event(&self, event: Event, delay: Duration) -> SimResult<()> {
        self.upgrade()?.schedule_event(event, delay);
        Ok(())
    }

    pub(crate) fn with_node<R>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut NodeState) -> R,
    ) -> SimResult<R> {
        self.upgrade()?.with_node(node, f)
    }
}
