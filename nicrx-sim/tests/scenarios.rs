//! Admission, blocking and control-packet scenarios on a single simulated
//! node.

use nicrx::{
    Completion, ControlKind, ConversationKey, MatchSpec, MemoryRegion, MessageHeader, NodeId,
    Packet, Pid, PostedReceive, ReceiveConfig, StreamState,
};
use nicrx_sim::{LinkConfiguration, MemoryTiming, SimCluster};

const NODE: NodeId = NodeId(0);

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

fn key(sender: u32) -> ConversationKey {
    ConversationKey::new(NodeId(sender), Pid(0), Pid(0))
}

fn header(key: ConversationKey, tag: u32, payload: Vec<u8>, length: usize) -> Packet {
    Packet::message_header(
        key,
        MessageHeader {
            tag,
            scope: 0,
            length,
        },
        payload,
    )
}

fn cluster(config: ReceiveConfig, seed: u64) -> SimCluster {
    SimCluster::new(
        1,
        config,
        LinkConfiguration::instant(),
        MemoryTiming::default(),
        seed,
    )
    .expect("valid config")
}

fn message_sources(cluster: &SimCluster) -> Vec<NodeId> {
    cluster
        .completions(NODE)
        .expect("node exists")
        .iter()
        .filter_map(|c| match c {
            Completion::Message { source_node, .. } => Some(*source_node),
            _ => None,
        })
        .collect()
}

/// One stream slot, two interleaved two-packet messages: the second header
/// waits until the first stream is reclaimed.
#[test]
fn scenario_a_second_stream_waits_for_budget() {
    init();
    let (a, b) = (key(1), key(2));
    let mut cluster = cluster(ReceiveConfig::default().with_limits(1, 4), 1);
    for cookie in 0..2 {
        cluster
            .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0), 8, cookie))
            .expect("post");
    }

    cluster
        .inject_all(
            NODE,
            [
                header(a, 1, vec![1, 2], 4),
                header(b, 2, vec![5, 6], 4),
                Packet::body(a, 1, vec![3, 4]).tail(),
                Packet::body(b, 1, vec![7, 8]).tail(),
            ],
        )
        .expect("inject");

    let mut b_admitted = false;
    while cluster.step().expect("step") {
        let engine = cluster.engine(NODE).expect("node exists");
        assert!(engine.active_stream_count() <= 1);
        if engine.stream_state(&b).is_some() && !b_admitted {
            b_admitted = true;
            assert_eq!(message_sources(&cluster), vec![NodeId(1)]);
            assert_eq!(engine.stream_state(&a), None);
        }
    }

    assert!(b_admitted);
    assert_eq!(message_sources(&cluster), vec![NodeId(1), NodeId(2)]);
    let engine = cluster.engine(NODE).expect("node exists");
    assert!(engine.metrics().admission_stalls > 0);
    assert_eq!(engine.metrics().peak_active_streams, 1);
    assert!(engine.is_idle());
    cluster.shutdown().expect("clean shutdown");
}

/// A header with no posted receive blocks; posting a match delivers the
/// buffered tail at once.
#[test]
fn scenario_b_blocked_header_drains_on_post() {
    init();
    let a = key(1);
    let mut cluster = cluster(ReceiveConfig::default(), 2);
    cluster
        .inject_all(
            NODE,
            [
                header(a, 9, vec![1, 2, 3], 6),
                Packet::body(a, 1, vec![4, 5, 6]).tail(),
            ],
        )
        .expect("inject");
    cluster.run_until_empty().expect("run");

    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.stream_state(&a), Some(StreamState::AwaitingMatch));
    let depth = engine.config().max_queue_depth;
    assert!(engine.stream(&a).is_some_and(|s| s.is_blocked(depth)));
    assert_eq!(engine.pending_packet_count(), 1);
    assert!(cluster.completions(NODE).expect("node exists").is_empty());

    let needs = cluster.needs(NODE).expect("node exists");
    assert_eq!(needs.len(), 1);
    assert_eq!(needs[0].tag, 9);
    assert_eq!(needs[0].length, 6);
    assert_eq!(needs[0].source_node, NodeId(1));

    let matcher = MatchSpec::any(0).from_source(NodeId(1), Pid(0)).with_tag(9);
    cluster
        .post_receive(NODE, Pid(0), PostedReceive::new(matcher, 6, 77))
        .expect("post");
    // Both packets are consumed by the post, but the stream stays Receiving
    // until the two host writes it issued call back.
    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.pending_packet_count(), 0);
    assert_eq!(engine.stream_state(&a), Some(StreamState::Receiving));
    assert_eq!(engine.stream(&a).map(|s| s.pending_operations()), Some(2));

    let mut seen_complete = false;
    while cluster.step().expect("step") {
        let engine = cluster.engine(NODE).expect("node exists");
        if let Some(stream) = engine.stream(&a) {
            if stream.state() == StreamState::Complete {
                assert_eq!(stream.pending_operations(), 0);
                seen_complete = true;
            }
        }
    }
    assert!(seen_complete);
    let completions = cluster.completions(NODE).expect("node exists");
    assert_eq!(completions.len(), 1);
    match &completions[0] {
        Completion::Message {
            cookie,
            data,
            truncated,
            ..
        } => {
            assert_eq!(*cookie, 77);
            assert_eq!(data, &vec![1, 2, 3, 4, 5, 6]);
            assert!(!truncated);
        }
        other => panic!("unexpected completion {other:?}"),
    }
    assert_eq!(cluster.engine(NODE).expect("node exists").stream_state(&a), None);
    cluster.shutdown().expect("clean shutdown");
}

#[test]
fn scenario_c_region_registration_round_trips() {
    init();
    let mut cluster = cluster(ReceiveConfig::default().with_processes(2), 3);
    let region = MemoryRegion::from_bytes(0xfeed, vec![1, 2, 3, 4]);

    let replaced = cluster
        .register_memory_region(NODE, Pid(1), 3, region.clone())
        .expect("register");
    assert_eq!(replaced, None);

    let engine = cluster.engine_mut(NODE).expect("node exists");
    assert_eq!(engine.lookup_memory_region(Pid(1), 3), Some(&region));
    assert_eq!(engine.lookup_memory_region(Pid(0), 3), None);
    assert_eq!(engine.lookup_memory_region(Pid(1), 4), None);

    assert_eq!(
        engine.deregister_memory_region(Pid(1), 3).expect("deregister"),
        Some(region)
    );
    cluster.shutdown().expect("clean shutdown");
}

/// A control packet for a key with no stream is consumed while the stream
/// budget is spent.
#[test]
fn scenario_d_control_bypasses_full_budget() {
    init();
    let (a, c) = (key(1), key(3));
    let mut cluster = cluster(ReceiveConfig::default().with_limits(1, 4), 4);
    cluster
        .inject_all(
            NODE,
            [
                header(a, 0, vec![1], 1).tail(),
                Packet::control(c, ControlKind::Credit(16)),
            ],
        )
        .expect("inject");
    cluster.run_until_empty().expect("run");

    let engine = cluster.engine(NODE).expect("node exists");
    assert_eq!(engine.active_stream_count(), 1);
    assert_eq!(engine.stream_state(&a), Some(StreamState::AwaitingMatch));
    assert_eq!(engine.stream_state(&c), None);
    assert_eq!(engine.metrics().control_packets, 1);
    assert_eq!(engine.pending_packet_count(), 0);
    assert_eq!(
        cluster.completions(NODE).expect("node exists"),
        vec![Completion::Control {
            pid: Pid(0),
            source_node: NodeId(3),
            kind: ControlKind::Credit(16),
        }]
    );

    cluster
        .post_receive(NODE, Pid(0), PostedReceive::new(MatchSpec::any(0), 1, 1))
        .expect("post");
    cluster.run_until_empty().expect("run");
    assert!(cluster.engine(NODE).expect("node exists").is_idle());
    cluster.shutdown().expect("clean shutdown");
}
