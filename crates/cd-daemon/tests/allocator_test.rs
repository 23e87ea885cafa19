use cd_core::config::{BatchConfig, FleetConfig, OperationsConfig};
use cd_core::tag::OperationTag;
use cd_core::types::{Node, OperationKind, TargetPhase, TargetProfile, TargetSnapshot, TargetState};
use cd_daemon::allocator::{pack_batches, partition, CapacityPool};
use cd_daemon::planner::{BatchPlanner, PlannedBatch};
use chrono::{DateTime, Utc};

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn snapshot(host: &str) -> TargetSnapshot {
    TargetSnapshot {
        hostname: host.into(),
        current_yield: 1_000_000.0,
        max_yield: 1_000_000.0,
        current_defense: 5.0,
        min_defense: 5.0,
        profile: TargetProfile::default(),
    }
}

/// Two planned batches with real ids, resized to the given thread counts.
fn two_batches(a: [u32; 4], b: [u32; 4]) -> Vec<PlannedBatch> {
    let mut state = TargetState::new("alpha", 1.0, 0.1);
    state.phase = TargetPhase::Batch;
    let mut planner = BatchPlanner::new();
    let mut batches =
        planner.plan_batches(&state, &snapshot("alpha"), 2, &BatchConfig::default(), now());
    assert_eq!(batches.len(), 2);
    for (batch, threads) in batches.iter_mut().zip([a, b]) {
        for (op, t) in batch.ops.iter_mut().zip(threads) {
            op.threads = t;
        }
    }
    batches
}

#[test]
fn big_batch_on_big_node_small_batch_split_across_the_rest() {
    let mut pool = CapacityPool::from_free(
        vec![
            ("big".into(), 100.0),
            ("mid".into(), 50.0),
            ("small".into(), 10.0),
        ],
        &OperationsConfig::uniform(1.0),
    );
    let batches = two_batches([50, 10, 30, 10], [30, 10, 15, 5]);

    let (placed, unplaced) = pack_batches(&mut pool, batches);
    assert!(unplaced.is_empty(), "both batches fit exactly");
    assert_eq!(placed.len(), 2);
    assert_eq!(pool.total_free(), 0.0);

    let a = &placed[0];
    assert!(a
        .ops
        .iter()
        .flat_map(|op| op.parts.iter())
        .all(|part| part.node == "big"));

    let b = &placed[1];
    let b_nodes: Vec<&str> = b
        .ops
        .iter()
        .flat_map(|op| op.parts.iter())
        .map(|part| part.node.as_str())
        .collect();
    assert!(b_nodes.iter().all(|n| *n == "mid" || *n == "small"));
    assert!(b_nodes.contains(&"mid") && b_nodes.contains(&"small"));
    assert_eq!(b.ops.iter().map(|op| op.threads()).sum::<u32>(), 60);

    assert!(a.batch.id < b.batch.id, "ids strictly increase");
    for p in &placed {
        let tag: OperationTag = p.batch.tag().to_string().parse().expect("valid tag");
        assert_eq!(tag.batch_id(), Some(p.batch.id));
    }
}

#[test]
fn partial_batch_places_nothing() {
    let mut pool =
        CapacityPool::from_free(vec![("only".into(), 10.0)], &OperationsConfig::uniform(1.0));
    let mut batches = two_batches([5, 3, 2, 2], [1, 1, 1, 1]);
    batches.truncate(1);

    let (placed, unplaced) = pack_batches(&mut pool, batches);
    assert!(placed.is_empty());
    assert_eq!(unplaced.len(), 1);
    assert_eq!(pool.total_free(), 10.0, "capacity untouched by the failed batch");
}

#[test]
fn a_later_batch_can_still_fit_after_an_earlier_one_fails() {
    let mut pool =
        CapacityPool::from_free(vec![("only".into(), 10.0)], &OperationsConfig::uniform(1.0));
    let batches = two_batches([8, 2, 2, 2], [4, 1, 2, 1]);

    let (placed, unplaced) = pack_batches(&mut pool, batches);
    assert_eq!(unplaced.len(), 1);
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].batch.id, 2);
    assert_eq!(pool.total_free(), 2.0);
}

#[test]
fn zero_share_and_primary_rules() {
    let nodes = vec![
        Node::new("home", 8.0, 8.0),
        Node::new("a", 16.0, 16.0),
        Node::new("b", 32.0, 32.0),
    ];
    let zero = partition(&nodes, &FleetConfig::default(), now());
    assert!(zero.share_servers.is_empty());
    assert_eq!(zero.hack_capacity, zero.total_capacity);
    assert_eq!(zero.timestamp, now());

    let config = FleetConfig {
        share_percent: 90.0,
        ..FleetConfig::default()
    };
    let heavy = partition(&nodes, &config, now());
    assert!(!heavy.share_servers.contains(&"home".to_string()));
    assert!(heavy.hack_servers.contains(&"home".to_string()));
    assert_eq!(heavy.share_capacity + heavy.hack_capacity, heavy.total_capacity);
}

#[test]
fn empty_fleet_is_a_valid_empty_allocation() {
    let alloc = partition(&[], &FleetConfig::default(), now());
    assert!(alloc.hack_servers.is_empty());
    assert_eq!(alloc.total_capacity, 0.0);

    let mut pool =
        CapacityPool::new(&[], &alloc, &FleetConfig::default(), &OperationsConfig::default());
    assert!(pool.place_up_to(OperationKind::Extract, 10).is_empty());
}
