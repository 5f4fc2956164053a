//! A set of receive engines sharing one simulation world.

use nicrx::{
    Completion, MemoryRegion, NeedReceive, NodeId, Packet, Pid, PostedReceive, RdmaOrigin,
    ReceiveConfig, ReceiveScheduler, Response,
};
use tracing::{debug, info, instrument};

use crate::always_assert;
use crate::config::{LinkConfiguration, MemoryTiming};
use crate::error::{SimError, SimResult};
use crate::events::Event;
use crate::providers::SimProviders;
use crate::world::{NodeTelemetry, SimWorld};

/// Engine type driven by the harness.
pub type SimEngine = ReceiveScheduler<SimProviders>;

/// N simulated NICs, each with its own receive engine, fed by one event
/// queue.
///
/// Packets are injected from outside the cluster; the sending side is not
/// simulated. Every processed event is followed by a check of the admission
/// bounds of the engine it touched.
pub struct SimCluster {
    world: SimWorld,
    engines: Vec<SimEngine>,
    link: LinkConfiguration,
}

impl SimCluster {
    /// Build `nodes` engines sharing `config`.
    pub fn new(
        nodes: usize,
        config: ReceiveConfig,
        link: LinkConfiguration,
        timing: MemoryTiming,
        seed: u64,
    ) -> SimResult<Self> {
        let world = SimWorld::new_with_seed(nodes, config.rx_channel, seed);
        let engines = (0..nodes)
            .map(|index| {
                let node = NodeId(index as u32);
                let providers = SimProviders::new(node, world.downgrade(), timing);
                ReceiveScheduler::new(config.clone(), providers).map_err(SimError::from)
            })
            .collect::<SimResult<Vec<_>>>()?;
        info!(nodes, seed, "Simulated cluster created");

        Ok(Self {
            world,
            engines,
            link,
        })
    }

    /// Single node with default timing.
    pub fn single(config: ReceiveConfig, seed: u64) -> SimResult<Self> {
        Self::new(
            1,
            config,
            LinkConfiguration::default(),
            MemoryTiming::default(),
            seed,
        )
    }

    /// Send `packet` to `node` with a sampled link latency.
    pub fn inject(&self, node: NodeId, packet: Packet) -> SimResult<()> {
        let latency = self.link.latency.sample();
        self.world.schedule_arrival(node, packet, latency)?;
        Ok(())
    }

    /// Send several packets to `node`, in order.
    pub fn inject_all(&self, node: NodeId, packets: impl IntoIterator<Item = Packet>) -> SimResult<()> {
        packets
            .into_iter()
            .try_for_each(|packet| self.inject(node, packet))
    }

    /// Process one event. Returns `false` once the queue is empty.
    pub fn step(&mut self) -> SimResult<bool> {
        let Some(event) = self.world.next_event() else {
            return Ok(false);
        };
        let node = event.node();
        let index = self.index(node)?;
        let engine = &mut self.engines[index];
        let result = match event {
            Event::PacketArrival { packet, .. } => {
                if self.world.deliver(node, packet)? {
                    engine.on_network_ready();
                }
                Ok(())
            }
            Event::Tick { .. } => engine.tick(),
            Event::MemoryComplete { token, .. } => engine.on_memory_complete(token),
        };
        result.map_err(|source| SimError::Engine { node, source })?;
        self.check_bounds(index);
        Ok(self.world.has_pending_events())
    }

    /// Process events until none is left.
    #[instrument(skip(self))]
    pub fn run_until_empty(&mut self) -> SimResult<()> {
        while self.step()? {}
        debug!(
            events = self.world.events_processed(),
            now = ?self.world.now(),
            "Event queue drained"
        );
        Ok(())
    }

    fn check_bounds(&self, index: usize) {
        let engine = &self.engines[index];
        let config = engine.config();
        always_assert!(
            active_streams_bounded,
            engine.active_stream_count() <= config.max_active_streams,
            format!(
                "node{index} has {} active streams, limit {}",
                engine.active_stream_count(),
                config.max_active_streams
            )
        );
        always_assert!(
            pending_packets_bounded,
            engine.pending_packet_count() <= config.max_pending_packets,
            format!(
                "node{index} buffers {} packets, limit {}",
                engine.pending_packet_count(),
                config.max_pending_packets
            )
        );
    }

    fn index(&self, node: NodeId) -> SimResult<usize> {
        let index = node.0 as usize;
        if index < self.engines.len() {
            Ok(index)
        } else {
            Err(SimError::UnknownNode(node))
        }
    }

    /// Engine of `node`.
    pub fn engine(&self, node: NodeId) -> SimResult<&SimEngine> {
        let index = self.index(node)?;
        Ok(&self.engines[index])
    }

    /// Mutable engine of `node`, for host-side calls.
    pub fn engine_mut(&mut self, node: NodeId) -> SimResult<&mut SimEngine> {
        let index = self.index(node)?;
        Ok(&mut self.engines[index])
    }

    /// Post a receive on `node` for process `pid`.
    pub fn post_receive(&mut self, node: NodeId, pid: Pid, entry: PostedReceive) -> SimResult<()> {
        self.engine_mut(node)?
            .post_receive(pid, entry)
            .map_err(|source| SimError::Engine { node, source })
    }

    /// Register a memory region on `node` for process `pid`.
    pub fn register_memory_region(
        &mut self,
        node: NodeId,
        pid: Pid,
        rgn: u16,
        region: MemoryRegion,
    ) -> SimResult<Option<MemoryRegion>> {
        self.engine_mut(node)?
            .register_memory_region(pid, rgn, region)
            .map_err(|source| SimError::Engine { node, source })
    }

    /// Register an origin buffer on `node` for process `pid`.
    pub fn register_rdma_origin(
        &mut self,
        node: NodeId,
        pid: Pid,
        key: u16,
        origin: RdmaOrigin,
    ) -> SimResult<Option<RdmaOrigin>> {
        self.engine_mut(node)?
            .register_rdma_origin(pid, key, origin)
            .map_err(|source| SimError::Engine { node, source })
    }

    /// Completions reported on `node`.
    pub fn completions(&self, node: NodeId) -> SimResult<Vec<Completion>> {
        self.world.completions(node)
    }

    /// Need-receive notices reported on `node`.
    pub fn needs(&self, node: NodeId) -> SimResult<Vec<NeedReceive>> {
        self.world.needs(node)
    }

    /// Responses transmitted by `node`.
    pub fn responses(&self, node: NodeId) -> SimResult<Vec<Response>> {
        self.world.responses(node)
    }

    /// Telemetry totals of `node`.
    pub fn telemetry(&self, node: NodeId) -> SimResult<NodeTelemetry> {
        self.world.telemetry(node)
    }

    /// Shared world.
    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether the cluster has no node.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Shut every engine down, returning the first leak.
    pub fn shutdown(self) -> SimResult<()> {
        let mut first = None;
        for (index, engine) in self.engines.into_iter().enumerate() {
            let node = NodeId(index as u32);
            if let Err(source) = engine.shutdown() {
                first.get_or_insert(SimError::Engine { node, source });
            }
        }
        first.map_or(Ok(()), Err)
    }
}
