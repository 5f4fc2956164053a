//! Randomized traffic for multi-seed simulation runs.
//!
//! A workload goes through three phases on a [`SimCluster`]:
//!
//! 1. **Setup**: draw the traffic of every node, pre-post part of the
//!    receives, inject the packets
//! 2. **Run**: drain the event queue, answer every need-receive notice with a
//!    matching post (sometimes in shuffled order), repeat until nothing is
//!    left to answer
//! 3. **Check**: compare what the hosts observed with what was sent
//!
//! Checks use `always_assert!`, so a violation panics with the seed that
//! reproduces it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use nicrx::{
    Completion, ControlKind, ConversationKey, MatchSpec, MessageHeader, NodeId, Opcode, Packet,
    Pid, PostedReceive, ReceiveConfig, ShmemHeader, ShmemOp,
};
use tracing::{debug, info, instrument};

use crate::cluster::SimCluster;
use crate::error::SimResult;
use crate::rng::{sim_chance, sim_random, sim_random_range, sim_random_range_or_default, sim_shuffle};
use crate::{always_assert, sometimes_assert};

/// First node id used by the (unsimulated) senders.
const SENDER_BASE: u32 = 1_000;

/// Heap word every fetch-add of a process targets.
const COUNTER_ADDR: usize = 0;

/// Shape of the traffic sent to every node of a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficWorkload {
    /// Remote nodes sending to each simulated node
    pub senders: u32,
    /// Local processes addressed on each node
    pub processes: u16,
    /// Conversations per (sender, process) pair
    pub conversations_per_key: usize,
    /// Largest message payload in bytes
    pub max_payload: usize,
    /// Largest number of body packets after a message header
    pub max_body_packets: usize,
    /// Probability that a message's receive is posted before traffic starts
    pub pre_post_ratio: f64,
    /// Probability that a conversation is a fetch-add instead of a message
    pub atomic_ratio: f64,
    /// Probability of a control packet between two conversations
    pub control_ratio: f64,
    /// Probability that a batch of need-receive notices is answered in
    /// shuffled order
    pub shuffle_answers_ratio: f64,
}

impl Default for TrafficWorkload {
    fn default() -> Self {
        Self {
            senders: 4,
            processes: 2,
            conversations_per_key: 6,
            max_payload: 256,
            max_body_packets: 4,
            pre_post_ratio: 0.5,
            atomic_ratio: 0.2,
            control_ratio: 0.1,
            shuffle_answers_ratio: 0.5,
        }
    }
}

/// Outcome of one workload execution, summed over every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    /// Messages delivered
    pub messages: usize,
    /// Fetch-adds executed
    pub atomics: usize,
    /// Control packets consumed
    pub control_packets: usize,
    /// Receives posted before traffic started
    pub early_receives: usize,
    /// Receives posted in answer to a need-receive notice
    pub late_receives: usize,
    /// Times a header waited for the stream budget
    pub admission_stalls: u64,
    /// Events processed by the world
    pub events: u64,
    /// Simulated time at quiescence
    pub elapsed: Duration,
}

/// What one node is expected to observe.
#[derive(Debug)]
pub struct TrafficPlan {
    node: NodeId,
    packets: Vec<Packet>,
    messages: HashMap<ConversationKey, Vec<(u32, Vec<u8>)>>,
    addends: HashMap<Pid, Vec<u64>>,
    pre_posts: Vec<(Pid, PostedReceive)>,
    controls: usize,
}

impl TrafficPlan {
    /// Node this plan targets.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Packets in injection order.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }
}

impl TrafficWorkload {
    /// Workload shape drawn from the current seed.
    pub fn random_for_seed() -> Self {
        Self {
            senders: sim_random_range(1..6),
            processes: sim_random_range(1..4),
            conversations_per_key: sim_random_range(1..8),
            max_payload: sim_random_range(0..512),
            max_body_packets: sim_random_range(0..6),
            pre_post_ratio: sim_random_range(0.0..1.0),
            atomic_ratio: sim_random_range(0.0..0.4),
            control_ratio: sim_random_range(0.0..0.3),
            shuffle_answers_ratio: sim_random_range(0.0..1.0),
        }
    }

    /// Engine limits under which this traffic always drains, drawn from the
    /// current seed.
    ///
    /// With no sender flow control a full packet buffer can wedge: every
    /// buffered head waits for a stream slot held by a stream whose next
    /// packet is still on the link. So either every key gets a slot of its
    /// own or the buffer holds the whole traffic of a node.
    pub fn random_config_for_seed(&self) -> ReceiveConfig {
        let keys = (self.senders as usize * usize::from(self.processes)).max(1);
        let config = ReceiveConfig::default()
            .with_processes(self.processes.max(1))
            .with_queue_depth(sim_random_range(1..8));
        if sim_chance(0.5) {
            config.with_limits(keys + sim_random_range(0..3), sim_random_range(1..8))
        } else {
            let per_conversation = self.max_body_packets + 2;
            let packets = keys * self.conversations_per_key * per_conversation;
            config.with_limits(sim_random_range(1..keys + 1), packets.max(1))
        }
    }

    /// Run every phase on `cluster`.
    pub fn execute(&self, cluster: &mut SimCluster) -> SimResult<WorkloadReport> {
        let plans = self.setup(cluster)?;
        let late_receives = self.run(cluster)?;
        self.check(cluster, &plans, late_receives)
    }

    /// Draw, pre-post and inject the traffic of every node.
    #[instrument(skip(self, cluster))]
    pub fn setup(&self, cluster: &mut SimCluster) -> SimResult<Vec<TrafficPlan>> {
        let mut plans = Vec::with_capacity(cluster.len());
        let mut cookie = 0;
        for index in 0..cluster.len() {
            let plan = self.plan(NodeId(index as u32), &mut cookie);
            for (pid, entry) in &plan.pre_posts {
                cluster.post_receive(plan.node, *pid, entry.clone())?;
            }
            cluster.inject_all(plan.node, plan.packets.iter().cloned())?;
            debug!(
                node = %plan.node,
                packets = plan.packets.len(),
                pre_posts = plan.pre_posts.len(),
                "Traffic injected"
            );
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Drive the cluster to quiescence, answering need-receive notices.
    ///
    /// Returns the number of receives posted late.
    #[instrument(skip(self, cluster))]
    pub fn run(&self, cluster: &mut SimCluster) -> SimResult<usize> {
        let mut answered = vec![0usize; cluster.len()];
        let mut late = 0;
        let mut cookie = u64::MAX / 2;
        loop {
            cluster.run_until_empty()?;

            let mut posted = false;
            for (index, seen) in answered.iter_mut().enumerate() {
                let node = NodeId(index as u32);
                let needs = cluster.needs(node)?;
                let mut batch = needs[*seen..].to_vec();
                *seen = needs.len();
                if batch.len() > 1 && sim_chance(self.shuffle_answers_ratio) {
                    sim_shuffle(&mut batch);
                    debug!(%node, notices = batch.len(), "Answering need-receive notices out of order");
                }
                for notice in batch {
                    let matcher = MatchSpec::any(0)
                        .from_source(notice.source_node, notice.source_pid)
                        .with_tag(notice.tag);
                    cookie += 1;
                    cluster.post_receive(
                        node,
                        notice.pid,
                        PostedReceive::new(matcher, notice.length, cookie),
                    )?;
                    late += 1;
                    posted = true;
                }
            }
            if !posted {
                return Ok(late);
            }
        }
    }

    /// Compare host observations with the plans.
    pub fn check(
        &self,
        cluster: &SimCluster,
        plans: &[TrafficPlan],
        late_receives: usize,
    ) -> SimResult<WorkloadReport> {
        let mut report = WorkloadReport {
            late_receives,
            events: cluster.world().events_processed(),
            elapsed: cluster.world().now(),
            ..WorkloadReport::default()
        };

        for plan in plans {
            let node = plan.node;
            let engine = cluster.engine(node)?;
            always_assert!(
                engine_quiescent,
                engine.is_idle() && engine.fault().is_none(),
                format!(
                    "{node} not idle: {} pending, {} active, fault {:?}",
                    engine.pending_packet_count(),
                    engine.active_stream_count(),
                    engine.fault()
                )
            );

            let completions = cluster.completions(node)?;
            let mut messages: HashMap<ConversationKey, Vec<(u32, Vec<u8>)>> = HashMap::new();
            let mut previous: HashMap<Pid, Vec<u64>> = HashMap::new();
            let mut controls = 0;
            for completion in completions {
                match completion {
                    Completion::Message {
                        pid,
                        source_node,
                        source_pid,
                        tag,
                        data,
                        truncated,
                        ..
                    } => {
                        always_assert!(
                            message_not_truncated,
                            !truncated,
                            format!("{node}: message from {source_node}/{source_pid} truncated")
                        );
                        messages
                            .entry(ConversationKey::new(source_node, source_pid, pid))
                            .or_default()
                            .push((tag, data));
                    }
                    Completion::Shmem {
                        pid,
                        op: ShmemOp::FetchAdd,
                        previous: Some(value),
                        ..
                    } => previous.entry(pid).or_default().push(value),
                    Completion::Control { .. } => controls += 1,
                    other => {
                        always_assert!(
                            expected_completion,
                            false,
                            format!("{node}: unexpected completion {other:?}")
                        );
                    }
                }
            }

            always_assert!(
                messages_in_order,
                messages == plan.messages,
                format!("{node}: delivered messages differ from the ones sent")
            );
            always_assert!(
                controls_consumed,
                controls == plan.controls,
                format!("{node}: {controls} control packets consumed, {} sent", plan.controls)
            );
            self.check_counters(cluster, plan, &mut previous)?;

            let atomics: usize = plan.addends.values().map(Vec::len).sum();
            let responses = cluster
                .responses(node)?
                .iter()
                .filter(|r| matches!(r.opcode, Opcode::Shmem(h) if h.op == ShmemOp::GetResp))
                .count();
            always_assert!(
                atomic_responses_sent,
                responses == atomics,
                format!("{node}: {responses} fetch-add responses for {atomics} operations")
            );

            let metrics = engine.metrics();
            let config = engine.config();
            sometimes_assert!(
                admission_stalled,
                metrics.admission_stalls > 0,
                "a header waited for the stream budget"
            );
            sometimes_assert!(
                header_waited_for_receive,
                metrics.receives_needed > 0,
                "a header arrived before its receive was posted"
            );
            sometimes_assert!(
                pending_limit_reached,
                metrics.peak_pending_packets == config.max_pending_packets,
                "the pending packet buffer filled up"
            );

            report.messages += plan.messages.values().map(Vec::len).sum::<usize>();
            report.atomics += atomics;
            report.control_packets += controls;
            report.early_receives += plan.pre_posts.len();
            report.admission_stalls += metrics.admission_stalls;
        }

        info!(
            messages = report.messages,
            atomics = report.atomics,
            events = report.events,
            elapsed = ?report.elapsed,
            "Workload checked"
        );
        Ok(report)
    }

    /// The counter holds the total and the fetch-add results are the
    /// prefix sums of some interleaving of the addends.
    ///
    /// Keys are swept in an unspecified order, so only the per-key order of
    /// the results is fixed.
    fn check_counters(
        &self,
        cluster: &SimCluster,
        plan: &TrafficPlan,
        previous: &mut HashMap<Pid, Vec<u64>>,
    ) -> SimResult<()> {
        let engine = cluster.engine(plan.node)?;
        for pid in (0..self.processes).map(Pid) {
            let addends = plan.addends.get(&pid).map_or(&[][..], Vec::as_slice);
            let total = addends.iter().fold(0u64, |acc, v| acc.wrapping_add(*v));
            let counter = engine
                .context(pid)
                .and_then(|ctx| ctx.heap().load_u64(COUNTER_ADDR));
            always_assert!(
                counter_total,
                counter == Some(total),
                format!("{} {pid}: counter {counter:?}, expected {total}", plan.node)
            );

            let seen = previous.entry(pid).or_default();
            seen.sort_unstable();
            let mut steps: Vec<u64> = seen
                .windows(2)
                .map(|pair| pair[1].wrapping_sub(pair[0]))
                .chain(seen.last().map(|last| total.wrapping_sub(*last)))
                .collect();
            steps.sort_unstable();
            let mut expected = addends.to_vec();
            expected.sort_unstable();
            always_assert!(
                fetch_add_prefix_sums,
                seen.first().map_or(true, |first| *first == 0) && steps == expected,
                format!(
                    "{} {pid}: fetch-add results {seen:?} are not prefix sums of {expected:?}",
                    plan.node
                )
            );
        }

        let mut per_key: HashMap<(NodeId, Pid, Pid), Vec<u64>> = HashMap::new();
        for response in cluster.responses(plan.node)? {
            let Opcode::Shmem(header) = response.opcode else {
                continue;
            };
            if header.op != ShmemOp::GetResp {
                continue;
            }
            if let Ok(bytes) = <[u8; 8]>::try_from(response.payload.as_slice()) {
                per_key
                    .entry((response.dest_node, response.dest_pid, response.source_pid))
                    .or_default()
                    .push(u64::from_le_bytes(bytes));
            }
        }
        for ((sender, sender_pid, pid), results) in per_key {
            always_assert!(
                fetch_add_key_order,
                results.windows(2).all(|pair| pair[0] < pair[1]),
                format!(
                    "{} {pid}: fetch-adds from {sender}/{sender_pid} ran out of order: {results:?}",
                    plan.node
                )
            );
        }
        Ok(())
    }

    /// Draw the traffic of `node`.
    ///
    /// Conversations of one key keep their order; keys are interleaved at
    /// random.
    pub fn plan(&self, node: NodeId, cookie: &mut u64) -> TrafficPlan {
        let mut plan = TrafficPlan {
            node,
            packets: Vec::new(),
            messages: HashMap::new(),
            addends: HashMap::new(),
            pre_posts: Vec::new(),
            controls: 0,
        };
        let mut queues: Vec<VecDeque<Packet>> = Vec::new();

        for sender in 0..self.senders {
            for dest in 0..self.processes {
                let key = ConversationKey::new(NodeId(SENDER_BASE + sender), Pid(0), Pid(dest));
                let mut queue = VecDeque::new();
                for _ in 0..self.conversations_per_key {
                    if sim_chance(self.control_ratio) {
                        queue.push_back(Packet::control(key, ControlKind::Credit(sim_random_range(1..16))));
                        plan.controls += 1;
                    }
                    if sim_chance(self.atomic_ratio) {
                        let operand = sim_random_range(1..100u64);
                        queue.push_back(fetch_add(key, operand, sim_random()));
                        plan.addends.entry(key.dest_pid).or_default().push(operand);
                    } else {
                        let tag = sim_random_range(0..4u32);
                        let data = self.payload();
                        if sim_chance(self.pre_post_ratio) {
                            *cookie += 1;
                            let matcher = MatchSpec::any(0)
                                .from_source(key.source_node, key.source_pid)
                                .with_tag(tag);
                            plan.pre_posts.push((
                                key.dest_pid,
                                PostedReceive::new(matcher, self.max_payload, *cookie),
                            ));
                        }
                        queue.extend(self.message(key, tag, &data));
                        plan.messages.entry(key).or_default().push((tag, data));
                    }
                }
                queues.push(queue);
            }
        }

        queues.retain(|q| !q.is_empty());
        while !queues.is_empty() {
            let index = sim_random_range(0..queues.len());
            if let Some(packet) = queues[index].pop_front() {
                plan.packets.push(packet);
            }
            if queues[index].is_empty() {
                queues.swap_remove(index);
            }
        }
        plan
    }

    /// Payload bytes counting up from a random base, so misordering shows.
    fn payload(&self) -> Vec<u8> {
        let len = sim_random_range(0..self.max_payload + 1);
        let base: u8 = sim_random();
        (0..len).map(|j| base.wrapping_add(j as u8)).collect()
    }

    fn message(&self, key: ConversationKey, tag: u32, data: &[u8]) -> Vec<Packet> {
        let header = MessageHeader {
            tag,
            scope: 0,
            length: data.len(),
        };
        let bodies = sim_random_range_or_default(0..self.max_body_packets + 1);
        let chunk = data.len().div_ceil(bodies + 1).max(1);
        let mut chunks = data.chunks(chunk);

        let mut packets = vec![Packet::message_header(
            key,
            header,
            chunks.next().map(<[u8]>::to_vec).unwrap_or_default(),
        )];
        packets.extend(
            chunks
                .enumerate()
                .map(|(i, part)| Packet::body(key, i as u32 + 1, part.to_vec())),
        );
        if let Some(last) = packets.pop() {
            packets.push(last.tail());
        }
        packets
    }
}

fn fetch_add(key: ConversationKey, operand: u64, resp_key: u16) -> Packet {
    let header = ShmemHeader {
        op: ShmemOp::FetchAdd,
        addr: COUNTER_ADDR,
        length: 8,
        operand,
        compare: 0,
        resp_key,
    };
    Packet::shmem_header(key, header, Vec::new()).tail()
}
