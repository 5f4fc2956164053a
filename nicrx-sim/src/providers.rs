//! Provider bundle wiring one engine to the simulation world.

use std::time::Duration;

use nicrx::{
    Completion, EngineClock, HostInterface, HostMemoryModel, MemoryToken, NeedReceive,
    NetworkLink, NicProviders, NodeId, Packet, Response, Telemetry, TelemetrySample, Transmit,
};
use tracing::{trace, warn};

use crate::config::MemoryTiming;
use crate::events::Event;
use crate::world::{NodeState, WeakSimWorld};

/// Simulated collaborators of the engine running on `node`.
///
/// Every handle points back at the shared world; none of them calls the
/// engine. Link wake-ups, ticks and memory callbacks become events that the
/// cluster dispatches later.
#[derive(Debug, Clone)]
pub struct SimProviders {
    node: NodeId,
    world: WeakSimWorld,
    timing: MemoryTiming,
}

impl SimProviders {
    /// Create the bundle for `node`.
    pub fn new(node: NodeId, world: WeakSimWorld, timing: MemoryTiming) -> Self {
        Self {
            node,
            world,
            timing,
        }
    }

    /// Node served by this bundle.
    pub fn node(&self) -> NodeId {
        self.node
    }

    fn schedule(&self, event: Event, delay: Duration) {
        if let Err(err) = self.world.schedule_event(event, delay) {
            warn!(node = %self.node, %err, "Dropping event scheduled after shutdown");
        }
    }

    /// Apply `f` to the node's host-side state. Returns `false` when the
    /// world is gone.
    fn record_on_node(&self, what: &'static str, f: impl FnOnce(&mut NodeState)) -> bool {
        match self.world.with_node(self.node, f) {
            Ok(()) => true,
            Err(err) => {
                warn!(node = %self.node, %err, what, "Dropping host-side record after shutdown");
                false
            }
        }
    }
}

impl NetworkLink for SimProviders {
    fn receive(&self, vc: usize) -> Option<Packet> {
        self.world
            .with_node(self.node, |state| {
                if state.channel == vc {
                    state.inbound.pop_front()
                } else {
                    None
                }
            })
            .ok()
            .flatten()
    }

    fn request_to_receive(&self, vc: usize) -> bool {
        self.world
            .with_node(self.node, |state| state.channel == vc && !state.inbound.is_empty())
            .unwrap_or(false)
    }

    fn set_notify(&self, vc: usize) {
        let armed = self.world.with_node(self.node, |state| {
            if state.channel == vc {
                state.notify_armed = true;
            }
        });
        if armed.is_err() {
            warn!(node = %self.node, "Link notification armed after shutdown");
        }
    }
}

impl EngineClock for SimProviders {
    fn schedule_tick(&self, delay: Duration) {
        trace!(node = %self.node, ?delay, "Tick scheduled");
        self.schedule(Event::Tick { node: self.node }, delay);
    }

    fn schedule_callback(&self, delay: Duration, token: MemoryToken) {
        self.schedule(
            Event::MemoryComplete {
                node: self.node,
                token,
            },
            delay,
        );
    }
}

impl HostMemoryModel for SimProviders {
    fn host_read_delay(&self, bytes: usize) -> Duration {
        self.timing.host_read.delay(bytes)
    }

    fn host_write_delay(&self, bytes: usize) -> Duration {
        self.timing.host_write.delay(bytes)
    }

    fn nic_access_delay(&self, bytes: usize) -> Duration {
        self.timing.nic_access.delay(bytes)
    }
}

impl HostInterface for SimProviders {
    fn need_receive(&self, notice: NeedReceive) {
        self.record_on_node("need_receive", |state| state.needs.push(notice));
    }

    fn complete(&self, completion: Completion) {
        self.record_on_node("completion", |state| state.completions.push(completion));
    }
}

impl Transmit for SimProviders {
    fn send(&self, response: Response) {
        self.record_on_node("response", |state| state.responses.push(response));
    }
}

impl Telemetry for SimProviders {
    fn record(&self, sample: TelemetrySample) {
        self.record_on_node("telemetry", |state| state.record_telemetry(sample));
    }
}

impl NicProviders for SimProviders {
    type Link = Self;
    type Clock = Self;
    type Memory = Self;
    type Host = Self;
    type Transmit = Self;
    type Telemetry = Self;

    fn link(&self) -> &Self::Link {
        self
    }

    fn clock(&self) -> &Self::Clock {
        self
    }

    fn memory(&self) -> &Self::Memory {
        self
    }

    fn host(&self) -> &Self::Host {
        self
    }

    fn transmit(&self) -> &Self::Transmit {
        self
    }

    fn telemetry(&self) -> &Self::Telemetry {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::SimWorld;
    use nicrx::{ControlKind, Pid};

    fn control() -> Completion {
        Completion::Control {
            pid: Pid(0),
            source_node: NodeId(4),
            kind: ControlKind::Ack,
        }
    }

    #[test]
    fn host_records_land_on_their_node() {
        let world = SimWorld::new_with_seed(2, 0, 1);
        let providers = SimProviders::new(NodeId(1), world.downgrade(), MemoryTiming::instant());
        providers.complete(control());
        providers.record(TelemetrySample::PacketReceived { bytes: 3 });

        assert_eq!(world.completions(NodeId(1)).expect("node exists"), vec![control()]);
        assert!(world.completions(NodeId(0)).expect("node exists").is_empty());
        assert_eq!(world.telemetry(NodeId(1)).expect("node exists").bytes, 3);
    }

    #[test]
    fn records_after_shutdown_are_dropped() {
        let world = SimWorld::new_with_seed(1, 0, 1);
        let providers = SimProviders::new(NodeId(0), world.downgrade(), MemoryTiming::instant());
        assert!(providers.record_on_node("completion", |state| state.completions.push(control())));

        drop(world);
        assert!(!providers.record_on_node("completion", |state| state.completions.push(control())));
        providers.complete(control());
        providers.send(Response {
            dest_node: NodeId(4),
            dest_pid: Pid(0),
            source_pid: Pid(0),
            opcode: nicrx::Opcode::Control(ControlKind::Ack),
            payload: Vec::new(),
        });
    }
}
