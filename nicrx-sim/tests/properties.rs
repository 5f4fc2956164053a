//! Engine properties checked on the simulated cluster: per-key ordering,
//! admission bounds, synchronous matching, deferred reclamation, sequence
//! policies and determinism.

use nicrx::{
    Completion, ConversationKey, MatchSpec, MessageHeader, NodeId, Packet, Pid, PostedReceive,
    ReceiveConfig, ReceiveError, SequencePolicy, StreamState, TelemetrySample,
};
use nicrx_sim::{
    set_sim_seed, LinkConfiguration, MemoryTiming, SimCluster, SimError, TrafficWorkload,
};

const NODE: NodeId = NodeId(0);

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn key(sender: u32) -> ConversationKey {
    ConversationKey::new(NodeId(sender), Pid(0), Pid(0))
}

/// Header plus `bodies` body packets, the last one flagged as tail.
fn message(key: ConversationKey, tag: u32, bodies: u32) -> Vec<Packet> {
    let length = (bodies as usize + 1) * 2;
    let header = MessageHeader {
        tag,
        scope: 0,
        length,
    };
    let mut packets = vec![Packet::message_header(key, header, vec![tag as u8, 0])];
    packets.extend((1..=bodies).map(|seq| Packet::body(key, seq, vec![tag as u8, seq as u8])));
    if let Some(last) = packets.pop() {
        packets.push(last.tail());
    }
    packets
}

fn jittery(config: ReceiveConfig, seed: u64) -> SimCluster {
    SimCluster::new(
        1,
        config,
        LinkConfiguration::random_for_seed(),
        MemoryTiming::random_for_seed(),
        seed,
    )
    .expect("valid config")
}

#[test]
fn one_stream_per_conversation_in_arrival_order() {
    init();
    let a = key(1);
    let mut cluster = jittery(ReceiveConfig::default().with_limits(2, 8), 21);
    for cookie in 0..5 {
        cluster
            .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0), 64, cookie))
            .expect("post");
    }
    for tag in 0..5 {
        cluster.inject_all(NODE, message(a, tag, tag)).expect("inject");
    }
    cluster.run_until_empty().expect("run");

    let completions = cluster.completions(NODE).expect("node exists");
    let tags: Vec<u32> = completions
        .iter()
        .filter_map(|c| match c {
            Completion::Message { tag, data, .. } => {
                let expected: Vec<u8> = (0..=*tag as u8).flat_map(|seq| [*tag as u8, seq]).collect();
                assert_eq!(data, &expected);
                Some(*tag)
            }
            _ => None,
        })
        .collect();
    assert_eq!(tags, vec![0, 1, 2, 3, 4]);

    let metrics = cluster.engine(NODE).expect("node exists").metrics().clone();
    assert_eq!(metrics.streams_created, 5);
    assert_eq!(metrics.streams_reclaimed, 5);
    assert_eq!(metrics.peak_active_streams, 1);
    cluster.shutdown().expect("clean shutdown");
}

#[test]
fn admission_bounds_hold_for_any_interleaving() {
    init();
    for seed in 0..20 {
        set_sim_seed(seed);
        let workload = TrafficWorkload {
            senders: 3,
            processes: 1,
            ..TrafficWorkload::default()
        };
        let config = ReceiveConfig::default().with_limits(3, 2);
        let mut cluster = jittery(config.clone(), seed);
        workload.execute(&mut cluster).expect("workload");

        let metrics = cluster.engine(NODE).expect("node exists").metrics().clone();
        assert!(metrics.peak_active_streams <= config.max_active_streams, "seed {seed}");
        assert!(metrics.peak_pending_packets <= config.max_pending_packets, "seed {seed}");
        let telemetry = cluster.telemetry(NODE).expect("node exists");
        assert_eq!(telemetry.packets, metrics.packets_received, "seed {seed}");
        assert_eq!(telemetry.bytes, metrics.bytes_received, "seed {seed}");
        cluster.shutdown().expect("clean shutdown");
    }
}

#[test]
fn pre_posted_receive_never_waits_for_a_match() {
    init();
    let mut cluster = jittery(ReceiveConfig::default(), 5);
    for sender in 1..=4 {
        let matcher = MatchSpec::any(0).from_source(NodeId(sender), Pid(0));
        cluster
            .post_receive(NODE, Pid(0), PostedReceive::new(matcher, 16, sender.into()))
            .expect("post");
    }
    for sender in 1..=4 {
        cluster.inject_all(NODE, message(key(sender), 1, 2)).expect("inject");
    }

    while cluster.step().expect("step") {
        let engine = cluster.engine(NODE).expect("node exists");
        for sender in 1..=4 {
            assert_ne!(engine.stream_state(&key(sender)), Some(StreamState::AwaitingMatch));
        }
    }

    assert!(cluster.needs(NODE).expect("node exists").is_empty());
    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.metrics().receives_needed, 0);
    assert_eq!(engine.metrics().streams_completed, 4);
    cluster.shutdown().expect("clean shutdown");
}

#[test]
fn late_match_completes_many_passes_later() {
    init();
    let a = key(1);
    let mut cluster = jittery(ReceiveConfig::default(), 8);
    cluster.inject_all(NODE, message(a, 4, 1)).expect("inject");
    for sender in 2..6 {
        cluster
            .inject(NODE, Packet::control(key(sender), nicrx::ControlKind::Ack))
            .expect("inject");
    }
    cluster.run_until_empty().expect("run");
    let events_before = cluster.world().events_processed();
    assert_eq!(
        cluster.engine(NODE).expect("node exists").stream_state(&a),
        Some(StreamState::AwaitingMatch)
    );

    cluster
        .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0).with_tag(4), 4, 9))
        .expect("post");
    cluster.run_until_empty().expect("run");

    assert!(cluster.world().events_processed() > events_before);
    let messages = cluster
        .completions(NODE)
        .expect("node exists")
        .into_iter()
        .filter(|c| matches!(c, Completion::Message { cookie: 9, .. }))
        .count();
    assert_eq!(messages, 1);
    cluster.shutdown().expect("clean shutdown");
}

/// Three headers block; their notices are answered last to first. Every
/// stream still completes.
#[test]
fn needs_answered_out_of_order_all_complete() {
    init();
    let mut cluster = jittery(ReceiveConfig::default(), 31);
    for sender in 1..=3 {
        cluster.inject_all(NODE, message(key(sender), sender, 1)).expect("inject");
    }
    cluster.run_until_empty().expect("run");

    let needs = cluster.needs(NODE).expect("node exists");
    assert_eq!(needs.len(), 3);
    for notice in needs.iter().rev() {
        let matcher = MatchSpec::any(0)
            .from_source(notice.source_node, notice.source_pid)
            .with_tag(notice.tag);
        cluster
            .post_receive(
                NODE,
                notice.pid,
                PostedReceive::new(matcher, notice.length, notice.tag.into()),
            )
            .expect("post");
    }
    cluster.run_until_empty().expect("run");

    let engine = cluster.engine(NODE).expect("node exists");
    for sender in 1..=3 {
        assert_eq!(engine.stream_state(&key(sender)), None, "sender {sender}");
    }
    let ctx = engine.context(Pid(0)).expect("context");
    assert_eq!(ctx.posted_count(), 0);
    assert_eq!(ctx.blocked_count(), 0);

    let mut cookies: Vec<u64> = cluster
        .completions(NODE)
        .expect("node exists")
        .iter()
        .filter_map(|c| match c {
            Completion::Message { cookie, .. } => Some(*cookie),
            _ => None,
        })
        .collect();
    cookies.sort_unstable();
    assert_eq!(cookies, vec![1, 2, 3]);
    cluster.shutdown().expect("clean shutdown");
}

/// The completing stream is still in the table right after the callback
/// that completed it; it disappears at the next pass.
#[test]
fn completed_stream_is_reclaimed_after_the_call() {
    init();
    let a = key(1);
    let mut cluster = SimCluster::new(
        1,
        ReceiveConfig::default(),
        LinkConfiguration::instant(),
        MemoryTiming::default(),
        13,
    )
    .expect("valid config");
    cluster
        .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0), 8, 1))
        .expect("post");
    cluster.inject_all(NODE, message(a, 0, 1)).expect("inject");

    let mut seen_complete = false;
    let mut completions = 0;
    while cluster.step().expect("step") {
        let now = cluster.completions(NODE).expect("node exists").len();
        if now > completions {
            completions = now;
            let engine = cluster.engine(NODE).expect("node exists");
            assert_eq!(engine.stream_state(&a), Some(StreamState::Complete));
            assert_eq!(engine.active_stream_count(), 1);
            seen_complete = true;
        }
    }

    assert!(seen_complete);
    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.stream_state(&a), None);
    assert_eq!(engine.active_stream_count(), 0);
    assert_eq!(engine.metrics().streams_reclaimed, 1);
    cluster.shutdown().expect("clean shutdown");
}

fn gapped(policy: SequencePolicy) -> SimCluster {
    let a = key(1);
    let header = MessageHeader {
        tag: 0,
        scope: 0,
        length: 3,
    };
    let mut cluster = SimCluster::new(
        1,
        ReceiveConfig::default().with_sequence_policy(policy),
        LinkConfiguration::instant(),
        MemoryTiming::instant(),
        17,
    )
    .expect("valid config");
    cluster
        .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0), 8, 1))
        .expect("post");
    cluster
        .inject_all(
            NODE,
            [
                Packet::message_header(a, header, vec![1]),
                Packet::body(a, 3, vec![2]),
                Packet::body(a, 4, vec![3]).tail(),
            ],
        )
        .expect("inject");
    cluster
}

#[test]
fn sequence_gap_fails_fast_by_default() {
    init();
    let mut cluster = gapped(SequencePolicy::FailFast);
    let err = cluster.run_until_empty().expect_err("gap is fatal");
    assert!(matches!(
        err,
        SimError::Engine {
            node: NODE,
            source: ReceiveError::SequenceGap {
                expected: 1,
                got: 3,
                ..
            }
        }
    ));

    let engine = cluster.engine_mut(NODE).expect("node exists");
    assert!(engine.fault().is_some());
    let refused = engine.post_receive(Pid(0), PostedReceive::new(MatchSpec::any(0), 1, 2));
    assert!(matches!(refused, Err(ReceiveError::Faulted(_))));
}

#[test]
fn sequence_gap_resync_keeps_the_packet() {
    init();
    let mut cluster = gapped(SequencePolicy::Resync);
    cluster.run_until_empty().expect("run");

    match cluster.completions(NODE).expect("node exists").as_slice() {
        [Completion::Message { data, .. }] => assert_eq!(data, &vec![1, 2, 3]),
        other => panic!("unexpected completions {other:?}"),
    }
    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.metrics().sequence_anomalies, 1);
    assert_eq!(cluster.telemetry(NODE).expect("node exists").sequence_anomalies, 1);
    cluster.shutdown().expect("clean shutdown");
}

#[test]
fn sequence_gap_discard_drops_the_packet() {
    init();
    let mut cluster = gapped(SequencePolicy::Discard);
    cluster.run_until_empty().expect("run");

    // Both body packets are out of sequence, the tail is lost with them.
    let engine = cluster.engine(NODE).expect("node exists");
    assert!(cluster.completions(NODE).expect("node exists").is_empty());
    assert_eq!(engine.metrics().sequence_anomalies, 2);
    assert_eq!(engine.stream_state(&key(1)), Some(StreamState::Receiving));
    assert_eq!(engine.pending_packet_count(), 0);
}

#[test]
fn identical_seeds_replay_identically() {
    init();
    fn run(seed: u64) -> (Vec<Completion>, Vec<TelemetrySample>, u64, std::time::Duration) {
        set_sim_seed(seed);
        let workload = TrafficWorkload::random_for_seed();
        let config = workload.random_config_for_seed();
        let mut cluster = SimCluster::new(
            1,
            config,
            LinkConfiguration::random_for_seed(),
            MemoryTiming::random_for_seed(),
            seed,
        )
        .expect("valid config");
        workload.execute(&mut cluster).expect("workload");
        let completions = cluster.completions(NODE).expect("node exists");
        let telemetry = cluster.telemetry(NODE).expect("node exists");
        let samples = vec![
            TelemetrySample::ActiveStreams(telemetry.active_streams),
            TelemetrySample::PendingPackets(telemetry.pending_packets),
        ];
        (
            completions,
            samples,
            cluster.world().events_processed(),
            cluster.world().now(),
        )
    }

    for seed in [3, 99, 4242] {
        assert_eq!(run(seed), run(seed), "seed {seed} diverged");
    }
}
