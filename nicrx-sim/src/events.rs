//! Simulation events and the time-ordered queue they wait in.

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use nicrx::{MemoryToken, NodeId, Packet};

/// Events that can be scheduled in the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A packet reaches the receive link of a node.
    PacketArrival {
        /// Receiving node
        node: NodeId,
        /// Packet delivered
        packet: Packet,
    },
    /// Processing pass requested by a node's engine.
    Tick {
        /// Node whose engine runs
        node: NodeId,
    },
    /// A modeled memory access finished.
    MemoryComplete {
        /// Node whose engine issued the access
        node: NodeId,
        /// Continuation handed back to the engine
        token: MemoryToken,
    },
}

impl Event {
    /// Node this event is for.
    pub fn node(&self) -> NodeId {
        match self {
            Event::PacketArrival { node, .. }
            | Event::Tick { node }
            | Event::MemoryComplete { node, .. } => *node,
        }
    }
}

/// An event scheduled for execution at a specific simulation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    time: Duration,
    event: Event,
    sequence: u64,
}

impl ScheduledEvent {
    /// Creates a new scheduled event.
    pub fn new(time: Duration, event: Event, sequence: u64) -> Self {
        Self {
            time,
            event,
            sequence,
        }
    }

    /// Returns the scheduled execution time.
    pub fn time(&self) -> Duration {
        self.time
    }

    /// Returns a reference to the event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Consumes the scheduled event and returns the event.
    pub fn into_event(self) -> Event {
        self.event
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: reverse both keys so the earliest time,
        // then the lowest sequence, pops first.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// A priority queue of events in chronological order.
///
/// Events scheduled for the same time pop in scheduling order.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
}

impl EventQueue {
    /// Creates a new empty event queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an event for execution.
    pub fn schedule(&mut self, event: ScheduledEvent) {
        self.heap.push(event);
    }

    /// Removes and returns the earliest scheduled event.
    pub fn pop_earliest(&mut self) -> Option<ScheduledEvent> {
        self.heap.pop()
    }

    /// Returns the earliest scheduled event without removing it.
    pub fn peek_earliest(&self) -> Option<&ScheduledEvent> {
        self.heap.peek()
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns the number of events in the queue.
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(node: u32) -> Event {
        Event::Tick { node: NodeId(node) }
    }

    #[test]
    fn events_pop_in_time_order() {
        let mut queue = EventQueue::new();
        queue.schedule(ScheduledEvent::new(Duration::from_nanos(300), tick(3), 0));
        queue.schedule(ScheduledEvent::new(Duration::from_nanos(100), tick(1), 1));
        queue.schedule(ScheduledEvent::new(Duration::from_nanos(200), tick(2), 2));

        let order: Vec<NodeId> = std::iter::from_fn(|| queue.pop_earliest())
            .map(|scheduled| scheduled.event().node())
            .collect();
        assert_eq!(order, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn same_time_events_keep_scheduling_order() {
        let mut queue = EventQueue::new();
        let at = Duration::from_nanos(50);
        queue.schedule(ScheduledEvent::new(at, tick(7), 2));
        queue.schedule(ScheduledEvent::new(at, tick(5), 0));
        queue.schedule(ScheduledEvent::new(at, tick(6), 1));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek_earliest().map(|e| e.event().node()), Some(NodeId(5)));
        let order: Vec<NodeId> = std::iter::from_fn(|| queue.pop_earliest())
            .map(|scheduled| scheduled.into_event().node())
            .collect();
        assert_eq!(order, vec![NodeId(5), NodeId(6), NodeId(7)]);
    }
}
