//! Daemon loop: mode selection, status publishing, persistence and exit
//! conditions.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use cd_core::clock::ManualClock;
use cd_core::config::{Config, ConfigSource, OperationsConfig, Strategy};
use cd_core::types::{ModeKind, OperationKind, TargetProfile, TargetSnapshot};
use cd_daemon::bus::BusMessage;
use cd_daemon::daemon::Daemon;
use cd_daemon::income::IncomeLog;
use cd_daemon::modes::NO_ELIGIBLE_TARGETS;
use cd_daemon::sim::SimCluster;
use cd_telemetry::metrics::{global_metrics, CYCLES};
use chrono::{DateTime, Duration, Utc};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn config(strategy: Strategy) -> Config {
    let mut config = Config::default();
    config.daemon.strategy = strategy;
    config.fleet.reserved_primary_capacity = 0.0;
    config.operations = OperationsConfig::uniform(1.0);
    config
}

fn target(host: &str, current_yield: f64, current_defense: f64) -> TargetSnapshot {
    TargetSnapshot {
        hostname: host.into(),
        current_yield,
        max_yield: 1_000_000.0,
        current_defense,
        min_defense: 5.0,
        profile: TargetProfile::default(),
    }
}

fn sim_with_capacity(clock: &Arc<ManualClock>, capacity: f64) -> Arc<SimCluster> {
    let sim = Arc::new(SimCluster::new(clock.clone(), OperationsConfig::uniform(1.0)));
    sim.add_node("home", capacity);
    sim
}

fn daemon(sim: &Arc<SimCluster>, clock: &Arc<ManualClock>, source: ConfigSource) -> Daemon {
    Daemon::new(sim.clone(), sim.clone(), clock.clone(), source)
}

// ---------------------------------------------------------------------------
// Loop control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_shot_runs_a_single_cycle_and_publishes() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    sim.add_target(target("alpha", 1_000_000.0, 5.0), 0.9);

    let mut cfg = config(Strategy::Batch);
    cfg.daemon.one_shot = true;
    cfg.batch.max_batches_per_target = 1;
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("income.json");

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(cfg))
        .with_income_log(IncomeLog::new(&log_path))
        .expect("income log");
    let rx = d.event_bus().subscribe();

    let cycles = d.run().await.expect("run");
    assert_eq!(cycles, 1);
    assert_eq!(d.mode_kind(), Some(ModeKind::Batch));
    assert!(log_path.exists(), "income log written after the cycle");

    let messages: Vec<BusMessage> = rx.try_iter().collect();
    assert!(matches!(messages.first(), Some(BusMessage::FleetAllocation(_))));
    let statuses: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Status(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].mode, ModeKind::Batch);
    assert_eq!(statuses[0].outstanding_batches, 1);
}

#[tokio::test]
async fn once_override_beats_config() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Legacy)));
    d.set_one_shot(true);
    let before = global_metrics().get_counter(CYCLES, &[("mode", "legacy")]);
    assert_eq!(d.run().await.expect("run"), 1);
    let after = global_metrics().get_counter(CYCLES, &[("mode", "legacy")]);
    assert!(after > before, "cycle counted under its mode");
}

#[tokio::test]
async fn shutdown_is_observed_between_cycles() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Legacy)));
    d.shutdown_handle().trigger();

    let cycles = tokio::time::timeout(StdDuration::from_secs(5), d.run())
        .await
        .expect("loop stops")
        .expect("run");
    assert_eq!(cycles, 1, "the started cycle completes");
}

#[tokio::test]
async fn landed_income_is_persisted_and_reloaded() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    sim.add_target(target("alpha", 1_000_000.0, 5.0), 0.9);
    let mut cfg = config(Strategy::Batch);
    cfg.batch.max_batches_per_target = 1;
    let dir = tempfile::tempdir().expect("tempdir");
    let log = IncomeLog::new(dir.path().join("income.json"));

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(cfg.clone()))
        .with_income_log(log.clone())
        .expect("income log");
    d.run_cycle().await;
    clock.advance(Duration::seconds(41));
    let status = d.run_cycle().await.status;

    assert_eq!(status.targets[0].total_landed, 1);
    assert_eq!(d.income().len(), 1);
    let reloaded = log.load(&cfg.income).expect("reload");
    assert_eq!(reloaded.len(), 1);
    let amount = reloaded.samples().next().map(|s| s.amount).unwrap_or_default();
    assert!((amount - 100_000.0).abs() < 1e-6, "landed income {amount}");
}

// ---------------------------------------------------------------------------
// Mode selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_strategy_picks_by_fleet_capacity() {
    let clock = Arc::new(ManualClock::new(t0()));

    let small = sim_with_capacity(&clock, 100.0);
    let mut d = daemon(&small, &clock, ConfigSource::fixed(config(Strategy::Auto)));
    d.run_cycle().await;
    assert_eq!(d.mode_kind(), Some(ModeKind::Legacy));

    let large = sim_with_capacity(&clock, 4_096.0);
    let mut d = daemon(&large, &clock, ConfigSource::fixed(config(Strategy::Auto)));
    d.run_cycle().await;
    assert_eq!(d.mode_kind(), Some(ModeKind::Batch));
}

#[tokio::test]
async fn strategy_change_in_config_file_switches_mode() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    sim.add_target(target("alpha", 1_000_000.0, 20.0), 0.9);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[daemon]\nstrategy = \"legacy\"\n").expect("write config");

    let mut d = daemon(&sim, &clock, ConfigSource::new(&path));
    d.run_cycle().await;
    assert_eq!(d.mode_kind(), Some(ModeKind::Legacy));

    std::fs::write(&path, "[daemon]\nstrategy = \"throughput\"\n").expect("rewrite config");
    d.run_cycle().await;
    assert_eq!(d.mode_kind(), Some(ModeKind::Throughput));

    std::fs::write(&path, "[daemon]\nstrategy = \"not-a-strategy\"\n").expect("break config");
    d.run_cycle().await;
    assert_eq!(d.mode_kind(), Some(ModeKind::Throughput), "bad file keeps last good config");
}

// ---------------------------------------------------------------------------
// Non-batch modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn legacy_counteracts_hardened_target() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 100.0);
    sim.add_target(target("alpha", 1_000_000.0, 20.0), 0.9);

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Legacy)));
    let result = d.run_cycle().await;

    let invocations = sim.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].kind, OperationKind::Counteract);
    assert_eq!(invocations[0].threads, 100);
    assert_eq!(invocations[0].tag, "legacy");
    assert_eq!(result.status.targets[0].action, Some(OperationKind::Counteract));
    assert_eq!(result.status.targets[0].phase, None);

    d.run_cycle().await;
    assert_eq!(sim.invocations().len(), 1, "no stacking while legacy work is live");
}

#[tokio::test]
async fn legacy_splits_capacity_evenly_and_uses_all_of_it() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    sim.add_target(target("alpha", 1_000_000.0, 20.0), 0.9);
    sim.add_target(target("beta", 1_000_000.0, 6.0), 0.5);

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Legacy)));
    d.run_cycle().await;

    let threads_for = |host: &str| -> u32 {
        sim.invocations()
            .iter()
            .filter(|r| r.target == host)
            .map(|r| r.threads)
            .sum()
    };
    // Far more than the 300 threads alpha's excess defense needs.
    assert_eq!(threads_for("alpha"), 500);
    assert_eq!(threads_for("beta"), 500);
}

#[tokio::test]
async fn throughput_saturates_lowest_defense_target() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 64.0);
    sim.add_target(target("hard", 1_000_000.0, 30.0), 0.9);
    sim.add_target(target("soft", 1_000_000.0, 8.0), 0.1);

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Throughput)));
    let result = d.run_cycle().await;

    let invocations = sim.invocations();
    assert!(!invocations.is_empty());
    assert!(invocations.iter().all(|r| {
        r.target == "soft" && r.kind == OperationKind::Counteract && r.tag == "throughput"
    }));
    assert_eq!(invocations.iter().map(|r| r.threads).sum::<u32>(), 64);
    assert_eq!(result.status.mode, ModeKind::Throughput);
}

#[tokio::test]
async fn drain_extracts_richest_first_and_exits() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 600.0);
    sim.add_target(target("poor", 10_000.0, 5.0), 0.9);
    sim.add_target(target("rich", 900_000.0, 5.0), 0.1);

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Drain)));
    let cycles = d.run().await.expect("run");
    assert_eq!(cycles, 1, "drain is one-shot");

    let invocations = sim.invocations();
    assert_eq!(invocations[0].target, "rich");
    assert_eq!(invocations[0].threads, 500);
    assert_eq!(invocations[1].target, "poor");
    assert_eq!(invocations[1].threads, 100, "whatever capacity is left");
    assert!(invocations
        .iter()
        .all(|r| r.kind == OperationKind::Extract && r.tag == "drain"));
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_inventory_reports_error_with_backoff() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    sim.fail_inventory(true);
    let cfg = config(Strategy::Batch);

    let mut d = daemon(&sim, &clock, ConfigSource::fixed(cfg.clone()));
    let result = d.run_cycle().await;
    assert!(result
        .status
        .error
        .as_deref()
        .is_some_and(|e| e.contains("node inventory")));
    assert_eq!(result.sleep, StdDuration::from_millis(cfg.daemon.no_target_backoff_ms));
}

#[tokio::test]
async fn no_targets_in_legacy_mode_is_an_error() {
    let clock = Arc::new(ManualClock::new(t0()));
    let sim = sim_with_capacity(&clock, 1_000.0);
    let mut d = daemon(&sim, &clock, ConfigSource::fixed(config(Strategy::Legacy)));
    let result = d.run_cycle().await;
    assert_eq!(result.status.error.as_deref(), Some(NO_ELIGIBLE_TARGETS));
}
