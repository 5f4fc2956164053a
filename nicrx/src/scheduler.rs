//! Top-level receive engine: bounded ingestion and dispatch.
//!
//! The scheduler pulls packets from the link into per-key FIFOs, then sweeps
//! the keys in arrival order. Each key advances at most one head packet per
//! pass:
//!
//! - control packets are consumed at once, outside the stream budget;
//! - a header with no stream is admitted while the budget allows it;
//! - any other packet goes to the key's stream unless it reports blocked.
//!
//! Anything that cannot proceed stays buffered. Completed streams are
//! reclaimed at the end of the pass, never from inside a stream call.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ReceiveConfig;
use crate::context::{PostOutcome, PostedReceive, ReceiveContext};
use crate::error::{ConfigError, ReceiveError, ReceiveResult};
use crate::memory::{MemoryRegion, RdmaOrigin};
use crate::metrics::ReceiveMetrics;
use crate::packet::{ConversationKey, Opcode, Packet, Pid};
use crate::providers::{
    Completion, EngineClock, HostInterface, NetworkLink, NicProviders, Telemetry, TelemetrySample,
};
use crate::stream::{MemoryToken, Stream, StreamEnv, StreamId, StreamState, StreamTable};

/// Receive engine of one NIC.
///
/// Single threaded: every entry point is driven by the external scheduler
/// (a tick or memory callback) or by the host.
pub struct ReceiveScheduler<P: NicProviders> {
    config: ReceiveConfig,
    providers: P,
    contexts: Vec<ReceiveContext>,
    streams: StreamTable,
    pending: HashMap<ConversationKey, VecDeque<Packet>>,
    /// Keys with buffered packets, in the order they first got one.
    key_order: VecDeque<ConversationKey>,
    pending_packets: usize,
    active_streams: usize,
    /// A tick is scheduled and has not run yet.
    ticking: bool,
    fault: Option<ReceiveError>,
    metrics: ReceiveMetrics,
}

impl<P: NicProviders> ReceiveScheduler<P> {
    /// Build an engine with one context per local process and arm the link
    /// notification.
    pub fn new(config: ReceiveConfig, providers: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let contexts = (0..config.num_processes)
            .map(|pid| {
                ReceiveContext::new(
                    Pid(pid),
                    config.shmem_heap_bytes,
                    config.duplicate_registration,
                )
            })
            .collect();
        providers.link().set_notify(config.rx_channel);
        info!(
            processes = config.num_processes,
            max_active_streams = config.max_active_streams,
            max_pending_packets = config.max_pending_packets,
            "Receive engine created"
        );

        Ok(Self {
            config,
            providers,
            contexts,
            streams: StreamTable::new(),
            pending: HashMap::new(),
            key_order: VecDeque::new(),
            pending_packets: 0,
            active_streams: 0,
            ticking: false,
            fault: None,
            metrics: ReceiveMetrics::new(),
        })
    }

    /// Wake-up from the link: schedule a pass unless one is already pending.
    pub fn on_network_ready(&mut self) {
        if self.fault.is_some() {
            warn!("Network wake-up ignored, engine faulted");
            return;
        }
        if !self.ticking {
            trace!("Network ready, scheduling pass");
            self.schedule_tick(Duration::ZERO);
        }
    }

    /// Run one processing pass.
    #[instrument(skip(self), fields(pending = self.pending_packets, active = self.active_streams))]
    pub fn tick(&mut self) -> ReceiveResult<()> {
        self.ensure_live()?;
        self.ticking = false;
        let result = self.run_pass();
        self.guard(result)
    }

    /// Hand a receive buffer to the context of `pid`.
    #[instrument(skip(self, entry), fields(cookie = entry.cookie))]
    pub fn post_receive(&mut self, pid: Pid, entry: PostedReceive) -> ReceiveResult<()> {
        self.ensure_live()?;
        let result = self.post_receive_inner(pid, entry);
        let result = self.guard(result);
        self.wake_if_ready();
        result
    }

    /// Register a memory region for RDMA under `rgn`.
    ///
    /// Returns the region it replaced under the overwrite policy.
    pub fn register_memory_region(
        &mut self,
        pid: Pid,
        rgn: u16,
        region: MemoryRegion,
    ) -> ReceiveResult<Option<MemoryRegion>> {
        self.ensure_live()?;
        let result = self
            .context_mut(pid)
            .and_then(|ctx| ctx.register_memory_region(rgn, region));
        self.guard(result)
    }

    /// Remove the memory region registered under `rgn`.
    pub fn deregister_memory_region(
        &mut self,
        pid: Pid,
        rgn: u16,
    ) -> ReceiveResult<Option<MemoryRegion>> {
        self.ensure_live()?;
        let result = self
            .context_mut(pid)
            .map(|ctx| ctx.deregister_memory_region(rgn));
        self.guard(result)
    }

    /// Memory region registered under `rgn` for `pid`.
    pub fn lookup_memory_region(&self, pid: Pid, rgn: u16) -> Option<&MemoryRegion> {
        self.context(pid)?.memory_region(rgn)
    }

    /// Register the buffer awaiting a get response under `key`.
    ///
    /// Returns the origin it replaced under the overwrite policy.
    pub fn register_rdma_origin(
        &mut self,
        pid: Pid,
        key: u16,
        origin: RdmaOrigin,
    ) -> ReceiveResult<Option<RdmaOrigin>> {
        self.ensure_live()?;
        let result = self
            .context_mut(pid)
            .and_then(|ctx| ctx.register_rdma_origin(key, origin));
        self.guard(result)
    }

    /// Origin registered under `key` for `pid`.
    pub fn rdma_origin(&self, pid: Pid, key: u16) -> Option<&RdmaOrigin> {
        self.context(pid)?.rdma_origin(key)
    }

    /// Continuation of a memory access issued by a stream.
    #[instrument(skip(self), fields(stream = token.stream.0))]
    pub fn on_memory_complete(&mut self, token: MemoryToken) -> ReceiveResult<()> {
        self.ensure_live()?;
        let result = self.complete_memory(token);
        let result = self.guard(result);
        self.wake_if_ready();
        result
    }

    /// Release one stream slot. Runs when a deferred delete is drained.
    pub fn decrement_active_stream_count(&mut self) -> ReceiveResult<()> {
        let result = self.release_slot();
        self.guard(result)
    }

    /// Tear down every context.
    ///
    /// Fails with the first [`ReceiveError::TeardownLeak`] when a context
    /// still holds posted receives, blocked streams or registrations.
    pub fn shutdown(self) -> ReceiveResult<()> {
        let Self {
            contexts,
            streams,
            pending_packets,
            fault,
            ..
        } = self;
        if let Some(fault) = &fault {
            warn!(%fault, "Shutting down faulted engine");
        }
        if !streams.is_empty() || pending_packets > 0 {
            warn!(
                streams = streams.len(),
                pending_packets, "Shutting down with work in flight"
            );
        }

        let mut first = None;
        for ctx in contexts {
            if let Err(err) = ctx.teardown() {
                error!(%err, "Receive context leaked");
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => {
                info!("Receive engine shut down");
                Ok(())
            }
        }
    }

    /// Streams admitted and not reclaimed yet.
    pub fn active_stream_count(&self) -> usize {
        self.active_streams
    }

    /// Packets buffered and not consumed yet.
    pub fn pending_packet_count(&self) -> usize {
        self.pending_packets
    }

    /// State of the stream currently serving `key`.
    pub fn stream_state(&self, key: &ConversationKey) -> Option<StreamState> {
        let id = self.streams.id_for(key)?;
        self.streams.get(id).map(Stream::state)
    }

    /// Stream currently serving `key`.
    pub fn stream(&self, key: &ConversationKey) -> Option<&Stream> {
        self.streams.get(self.streams.id_for(key)?)
    }

    /// No pass scheduled, nothing buffered and no stream alive.
    pub fn is_idle(&self) -> bool {
        !self.ticking && self.pending_packets == 0 && self.streams.is_empty()
    }

    /// Fatal error that stopped this engine, if any.
    pub fn fault(&self) -> Option<&ReceiveError> {
        self.fault.as_ref()
    }

    /// Running counters.
    pub fn metrics(&self) -> &ReceiveMetrics {
        &self.metrics
    }

    /// Configuration in use.
    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    /// Context serving `pid`.
    pub fn context(&self, pid: Pid) -> Option<&ReceiveContext> {
        self.contexts.get(usize::from(pid.0))
    }

    fn context_mut(&mut self, pid: Pid) -> ReceiveResult<&mut ReceiveContext> {
        self.contexts
            .get_mut(usize::from(pid.0))
            .ok_or(ReceiveError::UnknownProcess(pid))
    }

    fn ensure_live(&self) -> ReceiveResult<()> {
        match &self.fault {
            Some(err) => Err(ReceiveError::Faulted(err.to_string())),
            None => Ok(()),
        }
    }

    /// Record the first fatal error.
    fn guard<T>(&mut self, result: ReceiveResult<T>) -> ReceiveResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() && self.fault.is_none() {
                error!(%err, "Receive engine faulted");
                self.fault = Some(err.clone());
            }
        }
        result
    }

    fn schedule_tick(&mut self, delay: Duration) {
        self.ticking = true;
        self.providers.clock().schedule_tick(delay);
    }

    fn wake_if_ready(&mut self) {
        if self.fault.is_none() && !self.ticking && self.has_ready_work() {
            self.schedule_tick(self.config.tick_interval);
        }
    }

    fn run_pass(&mut self) -> ReceiveResult<()> {
        self.pull()?;
        self.sweep()?;
        self.drain_deferred_deletes()?;

        let telemetry = self.providers.telemetry();
        telemetry.record(TelemetrySample::ActiveStreams(self.active_streams));
        telemetry.record(TelemetrySample::PendingPackets(self.pending_packets));

        if self.has_ready_work() {
            self.schedule_tick(self.config.tick_interval);
        } else {
            trace!(
                pending = self.pending_packets,
                active = self.active_streams,
                "No runnable work, waiting for the link"
            );
            self.providers.link().set_notify(self.config.rx_channel);
        }
        Ok(())
    }

    fn pull(&mut self) -> ReceiveResult<()> {
        let vc = self.config.rx_channel;
        while self.pending_packets < self.config.max_pending_packets {
            let Some(packet) = self.providers.link().receive(vc) else {
                break;
            };
            if usize::from(packet.dest_pid.0) >= self.contexts.len() {
                return Err(ReceiveError::UnknownProcess(packet.dest_pid));
            }

            self.pending_packets += 1;
            self.metrics
                .record_packet(packet.payload_size, self.pending_packets);
            self.providers.telemetry().record(TelemetrySample::PacketReceived {
                bytes: packet.payload_size,
            });

            let key = packet.key();
            trace!(%key, sequence = packet.sequence, header = packet.is_header, tail = packet.is_tail, control = packet.is_control, "Packet buffered");
            match self.pending.entry(key) {
                Entry::Occupied(mut queue) => queue.get_mut().push_back(packet),
                Entry::Vacant(slot) => {
                    self.key_order.push_back(key);
                    slot.insert(VecDeque::from([packet]));
                }
            }
        }
        Ok(())
    }

    fn sweep(&mut self) -> ReceiveResult<()> {
        let keys: Vec<ConversationKey> = self.key_order.iter().copied().collect();
        for key in keys {
            self.advance_key(key)?;
        }
        Ok(())
    }

    fn advance_key(&mut self, key: ConversationKey) -> ReceiveResult<()> {
        let Some(head) = self.pending.get(&key).and_then(VecDeque::front) else {
            return Ok(());
        };

        if head.is_control {
            if let Some(packet) = self.dequeue(key) {
                self.handle_control(packet)?;
            }
            return Ok(());
        }

        match self.streams.id_for(&key) {
            None => {
                if !head.is_header {
                    return Err(ReceiveError::BodyBeforeHeader(key));
                }
                if self.active_streams >= self.config.max_active_streams {
                    trace!(%key, "Stream budget spent, header stays queued");
                    self.metrics.record_admission_stall();
                    return Ok(());
                }
                let Some(packet) = self.dequeue(key) else {
                    return Ok(());
                };
                let id = self.streams.admit(&packet)?;
                self.active_streams += 1;
                self.metrics.record_admission(self.active_streams);
                debug!(%key, stream = id.0, active = self.active_streams, "Stream admitted");
                self.feed(id, packet)
            }
            Some(id) => {
                let depth = self.config.max_queue_depth;
                if self.streams.get(id).map_or(true, |s| s.is_blocked(depth)) {
                    return Ok(());
                }
                match self.dequeue(key) {
                    Some(packet) => self.feed(id, packet),
                    None => Ok(()),
                }
            }
        }
    }

    /// Feed `key`'s buffered stream packets to `id` until it blocks.
    fn drain_key(&mut self, key: ConversationKey, id: StreamId) -> ReceiveResult<()> {
        let depth = self.config.max_queue_depth;
        loop {
            let ready = self
                .pending
                .get(&key)
                .and_then(VecDeque::front)
                .is_some_and(|head| !head.is_control)
                && self.streams.get(id).is_some_and(|s| !s.is_blocked(depth));
            if !ready {
                return Ok(());
            }
            match self.dequeue(key) {
                Some(packet) => self.feed(id, packet)?,
                None => return Ok(()),
            }
        }
    }

    fn dequeue(&mut self, key: ConversationKey) -> Option<Packet> {
        let queue = self.pending.get_mut(&key)?;
        let packet = queue.pop_front()?;
        if queue.is_empty() {
            self.pending.remove(&key);
            self.key_order.retain(|k| *k != key);
        }
        self.pending_packets -= 1;
        Some(packet)
    }

    fn feed(&mut self, id: StreamId, packet: Packet) -> ReceiveResult<()> {
        let pid = packet.dest_pid;
        self.with_stream(id, pid, |stream, env| stream.process(packet, env))
    }

    fn with_stream<T, F>(&mut self, id: StreamId, pid: Pid, f: F) -> ReceiveResult<T>
    where
        F: FnOnce(&mut Stream, &mut StreamEnv<'_, P>) -> ReceiveResult<T>,
    {
        let ctx = self
            .contexts
            .get_mut(usize::from(pid.0))
            .ok_or(ReceiveError::UnknownProcess(pid))?;
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(ReceiveError::UnknownStream(id.0))?;
        let mut env = StreamEnv {
            ctx,
            providers: &self.providers,
            config: &self.config,
            metrics: &mut self.metrics,
        };
        f(stream, &mut env)
    }

    fn handle_control(&mut self, packet: Packet) -> ReceiveResult<()> {
        let Opcode::Control(kind) = packet.opcode else {
            return Err(ReceiveError::Faulted(format!(
                "control packet without control opcode on {}",
                packet.key()
            )));
        };
        trace!(key = %packet.key(), ?kind, "Control packet consumed");
        self.metrics.record_control();
        self.providers.host().complete(Completion::Control {
            pid: packet.dest_pid,
            source_node: packet.source_node,
            kind,
        });
        Ok(())
    }

    fn post_receive_inner(&mut self, pid: Pid, entry: PostedReceive) -> ReceiveResult<()> {
        let ctx = self
            .contexts
            .get_mut(usize::from(pid.0))
            .ok_or(ReceiveError::UnknownProcess(pid))?;
        let (mut id, mut entry) = match ctx.post_receive(entry, &self.streams) {
            PostOutcome::Queued => return Ok(()),
            PostOutcome::Resume(id, entry) => (id, entry),
        };
        loop {
            self.resume(id, pid, entry)?;
            let ctx = self
                .contexts
                .get_mut(usize::from(pid.0))
                .ok_or(ReceiveError::UnknownProcess(pid))?;
            match ctx.resume_next(&self.streams) {
                Some((next, queued)) => {
                    id = next;
                    entry = queued;
                }
                None => return Ok(()),
            }
        }
    }

    /// Hand `entry` to the blocked stream `id` and feed it what is buffered.
    fn resume(&mut self, id: StreamId, pid: Pid, entry: PostedReceive) -> ReceiveResult<()> {
        self.with_stream(id, pid, |stream, env| stream.resume(entry, env))?;
        let key = self
            .streams
            .get(id)
            .map(Stream::key)
            .ok_or(ReceiveError::UnknownStream(id.0))?;
        self.drain_key(key, id)
    }

    fn complete_memory(&mut self, token: MemoryToken) -> ReceiveResult<()> {
        let pid = self
            .streams
            .get(token.stream)
            .map(|s| s.key().dest_pid)
            .ok_or(ReceiveError::UnknownStream(token.stream.0))?;
        self.with_stream(token.stream, pid, |stream, env| {
            stream.on_memory_complete(token.access, env)
        })
    }

    fn drain_deferred_deletes(&mut self) -> ReceiveResult<()> {
        for index in 0..self.contexts.len() {
            for id in self.contexts[index].take_deferred_deletes() {
                let stream = self
                    .streams
                    .reclaim(id)
                    .ok_or(ReceiveError::UnknownStream(id.0))?;
                self.metrics.record_reclaim();
                self.release_slot()?;
                debug!(key = %stream.key(), stream = id.0, active = self.active_streams, "Stream reclaimed");
            }
        }
        Ok(())
    }

    fn release_slot(&mut self) -> ReceiveResult<()> {
        self.active_streams = self
            .active_streams
            .checked_sub(1)
            .ok_or(ReceiveError::StreamCountUnderflow)?;
        Ok(())
    }

    /// Whether another pass could make progress right now.
    fn has_ready_work(&self) -> bool {
        if self.contexts.iter().any(ReceiveContext::has_deferred_deletes) {
            return true;
        }
        if self.pending_packets < self.config.max_pending_packets
            && self.providers.link().request_to_receive(self.config.rx_channel)
        {
            return true;
        }
        self.pending.iter().any(|(key, queue)| {
            queue
                .front()
                .is_some_and(|head| self.can_advance(key, head))
        })
    }

    fn can_advance(&self, key: &ConversationKey, head: &Packet) -> bool {
        if head.is_control {
            return true;
        }
        match self.streams.id_for(key) {
            None => self.active_streams < self.config.max_active_streams,
            Some(id) => self
                .streams
                .get(id)
                .is_some_and(|s| !s.is_blocked(self.config.max_queue_depth)),
        }
    }
}
