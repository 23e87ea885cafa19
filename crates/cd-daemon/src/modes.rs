//! The four operating modes behind one `run_cycle` contract.
//!
//! The mode is a closed enum picked by [`select_mode`], a pure function of
//! the configured strategy and fleet size. Every mode partitions the fleet,
//! publishes the allocation and returns the same [`StatusSnapshot`] shape.

use std::time::Duration as StdDuration;

use cd_core::clock::Clock;
use cd_core::config::{Config, FleetConfig, LegacyConfig, Strategy};
use cd_core::tag::OperationTag;
use cd_core::types::{
    FleetAllocation, ModeKind, Node, OperationKind, ScoredTarget, StatusSnapshot, TargetSnapshot,
    TargetStatus,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::allocator::{partition, CapacityPool, PlacedOp};
use crate::bus::{BusMessage, EventBus};
use crate::cluster::{Cluster, ClusterError, TargetRegistry};
use crate::dispatcher::Dispatcher;
use crate::engine::BatchEngine;
use crate::income::IncomeTracker;
use crate::live::LiveIndex;

pub const NO_ELIGIBLE_TARGETS: &str = "no eligible targets";

const EPSILON: f64 = 1e-9;

/// Everything a mode borrows for one cycle.
pub struct CycleContext<'a> {
    pub cluster: &'a dyn Cluster,
    pub registry: &'a dyn TargetRegistry,
    pub clock: &'a dyn Clock,
    pub bus: &'a EventBus,
    pub income: &'a mut IncomeTracker,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    pub status: StatusSnapshot,
    /// How long the loop should sleep before the next cycle.
    pub sleep: StdDuration,
    /// The mode has nothing more to do and the daemon should exit.
    pub finished: bool,
}

impl CycleResult {
    pub fn new(status: StatusSnapshot, sleep: StdDuration) -> Self {
        Self {
            status,
            sleep,
            finished: false,
        }
    }

    /// An error status followed by the long no-target backoff.
    pub fn backoff(status: StatusSnapshot, config: &Config) -> Self {
        Self::new(
            status,
            StdDuration::from_millis(config.daemon.no_target_backoff_ms),
        )
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Pick the mode for a strategy and fleet size.
pub fn select_mode(strategy: Strategy, total_capacity: f64, fleet: &FleetConfig) -> ModeKind {
    match strategy {
        Strategy::Auto if total_capacity >= fleet.batch_min_capacity => ModeKind::Batch,
        Strategy::Auto => ModeKind::Legacy,
        Strategy::Batch => ModeKind::Batch,
        Strategy::Legacy => ModeKind::Legacy,
        Strategy::Throughput => ModeKind::Throughput,
        Strategy::Drain => ModeKind::Drain,
    }
}

pub enum Mode {
    Batch(BatchEngine),
    Legacy(LegacyMode),
    Throughput(ThroughputMode),
    Drain(DrainMode),
}

impl Mode {
    pub fn new(kind: ModeKind) -> Self {
        match kind {
            ModeKind::Batch => Mode::Batch(BatchEngine::new()),
            ModeKind::Legacy => Mode::Legacy(LegacyMode),
            ModeKind::Throughput => Mode::Throughput(ThroughputMode),
            ModeKind::Drain => Mode::Drain(DrainMode),
        }
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Batch(_) => ModeKind::Batch,
            Mode::Legacy(_) => ModeKind::Legacy,
            Mode::Throughput(_) => ModeKind::Throughput,
            Mode::Drain(_) => ModeKind::Drain,
        }
    }

    pub async fn run_cycle(&mut self, ctx: &mut CycleContext<'_>, config: &Config) -> CycleResult {
        match self {
            Mode::Batch(engine) => engine.run_cycle(ctx, config).await,
            Mode::Legacy(mode) => mode.run_cycle(ctx, config).await,
            Mode::Throughput(mode) => mode.run_cycle(ctx, config).await,
            Mode::Drain(mode) => mode.run_cycle(ctx, config).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared cycle steps
// ---------------------------------------------------------------------------

/// Nodes and their partition for the current cycle.
pub(crate) struct FleetSurvey {
    pub now: DateTime<Utc>,
    pub nodes: Vec<Node>,
    pub allocation: FleetAllocation,
}

impl FleetSurvey {
    pub fn pool(&self, config: &Config) -> CapacityPool {
        CapacityPool::new(&self.nodes, &self.allocation, &config.fleet, &config.operations)
    }
}

/// Read the node inventory, partition it and publish the allocation. An
/// unreadable inventory ends the cycle with an error status.
pub(crate) async fn survey_fleet(
    ctx: &CycleContext<'_>,
    config: &Config,
    mode: ModeKind,
) -> Result<FleetSurvey, CycleResult> {
    let now = ctx.clock.now();
    let nodes = match ctx.cluster.nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "node inventory unavailable");
            let status = StatusSnapshot::empty(mode, now)
                .with_error(format!("node inventory unavailable: {e}"));
            return Err(CycleResult::backoff(status, config));
        }
    };
    let allocation = partition(&nodes, &config.fleet, now);
    debug!(
        hack_servers = allocation.hack_servers.len(),
        share_servers = allocation.share_servers.len(),
        hack_capacity = allocation.hack_capacity,
        "fleet partitioned"
    );
    ctx.bus.publish(BusMessage::FleetAllocation(allocation.clone()));
    Ok(FleetSurvey {
        now,
        nodes,
        allocation,
    })
}

/// The top `max_targets` of a scoring pass, best first.
pub(crate) async fn top_targets(
    ctx: &CycleContext<'_>,
    config: &Config,
) -> Result<Vec<ScoredTarget>, ClusterError> {
    let mut scored = ctx.registry.score_targets().await?;
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(config.targets.max_targets);
    Ok(scored)
}

/// Snapshots for the scored targets that could be read this cycle.
async fn read_targets(
    ctx: &CycleContext<'_>,
    scored: &[ScoredTarget],
) -> Vec<(ScoredTarget, TargetSnapshot)> {
    let mut out = Vec::with_capacity(scored.len());
    for entry in scored {
        match ctx.cluster.target(&entry.hostname).await {
            Ok(snapshot) => out.push((entry.clone(), snapshot)),
            Err(e) => warn!(
                target_host = %entry.hostname,
                error = %e,
                "target read failed, skipping"
            ),
        }
    }
    out
}

fn interval(config: &Config) -> StdDuration {
    StdDuration::from_millis(config.daemon.cycle_interval_ms)
}

fn no_targets(mode: ModeKind, now: DateTime<Utc>, income: f64, config: &Config) -> CycleResult {
    let mut status = StatusSnapshot::empty(mode, now).with_error(NO_ELIGIBLE_TARGETS);
    status.income_per_sec = income;
    CycleResult::backoff(status, config)
}

fn whole_op(kind: OperationKind, parts: Vec<crate::allocator::Placement>) -> Vec<PlacedOp> {
    if parts.is_empty() {
        return Vec::new();
    }
    vec![PlacedOp {
        kind,
        launch_delay: Duration::zero(),
        parts,
    }]
}

/// Threads that take a target's whole current yield in one extraction.
fn exhausting_extract_threads(snapshot: &TargetSnapshot) -> u32 {
    let per_thread = snapshot.profile.extract_fraction_per_thread;
    if per_thread <= 0.0 {
        return 0;
    }
    (1.0 / per_thread - EPSILON).ceil() as u32
}

// ---------------------------------------------------------------------------
// Legacy
// ---------------------------------------------------------------------------

/// One dominant operation per target, sized to saturate an equal share of
/// free capacity. No timing coordination between targets or cycles.
#[derive(Debug, Default)]
pub struct LegacyMode;

/// The operation the static rule picks for a target.
pub fn legacy_action(snapshot: &TargetSnapshot, config: &LegacyConfig) -> OperationKind {
    if snapshot.current_defense > snapshot.min_defense + config.defense_margin {
        OperationKind::Counteract
    } else if snapshot.current_yield < snapshot.max_yield * config.yield_threshold {
        OperationKind::Restore
    } else {
        OperationKind::Extract
    }
}

impl LegacyMode {
    pub async fn run_cycle(&mut self, ctx: &mut CycleContext<'_>, config: &Config) -> CycleResult {
        let survey = match survey_fleet(ctx, config, ModeKind::Legacy).await {
            Ok(s) => s,
            Err(result) => return result,
        };
        let income = ctx.income.smoothed_rate();
        let scored = top_targets(ctx, config).await.unwrap_or_else(|e| {
            warn!(error = %e, "target scoring failed");
            Vec::new()
        });
        if scored.is_empty() {
            return no_targets(ModeKind::Legacy, survey.now, income, config);
        }

        let live = LiveIndex::scan(ctx.cluster, &survey.nodes).await;
        let mut pool = survey.pool(config);
        let mut dispatcher = Dispatcher::new(ctx.cluster, survey.now);
        let readable = read_targets(ctx, &scored).await;
        let mut rows = Vec::with_capacity(readable.len());

        let mut remaining = readable.len();
        for (entry, snapshot) in &readable {
            let kind = legacy_action(snapshot, &config.legacy);
            rows.push(TargetStatus::action(&entry.hostname, entry.score, kind));

            if live.has_tagged(&entry.hostname, OperationTag::Legacy) {
                remaining -= 1;
                continue;
            }
            let share = pool.total_free() / remaining as f64;
            remaining -= 1;
            let threads = (share / config.operations.cost(kind)).floor() as u32;
            if threads == 0 {
                continue;
            }
            let ops = whole_op(kind, pool.place_up_to(kind, threads));
            dispatcher
                .dispatch_ops(&entry.hostname, OperationTag::Legacy, &ops)
                .await;
        }

        let mut status = StatusSnapshot::empty(ModeKind::Legacy, survey.now);
        status.targets = rows;
        status.dispatched_ops = dispatcher.dispatched();
        status.rejected_ops = dispatcher.rejected();
        status.income_per_sec = income;
        CycleResult::new(status, interval(config))
    }
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

/// Saturates the lowest-defense target with counteract.
#[derive(Debug, Default)]
pub struct ThroughputMode;

impl ThroughputMode {
    pub async fn run_cycle(&mut self, ctx: &mut CycleContext<'_>, config: &Config) -> CycleResult {
        let survey = match survey_fleet(ctx, config, ModeKind::Throughput).await {
            Ok(s) => s,
            Err(result) => return result,
        };
        let income = ctx.income.smoothed_rate();
        let scored = top_targets(ctx, config).await.unwrap_or_else(|e| {
            warn!(error = %e, "target scoring failed");
            Vec::new()
        });
        let readable = read_targets(ctx, &scored).await;
        let Some((entry, _)) = readable.iter().min_by(|(a_entry, a), (b_entry, b)| {
            a.current_defense
                .partial_cmp(&b.current_defense)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_entry.hostname.cmp(&b_entry.hostname))
        }) else {
            return no_targets(ModeKind::Throughput, survey.now, income, config);
        };

        let mut pool = survey.pool(config);
        let threads = pool.threads_available(OperationKind::Counteract);
        let ops = whole_op(
            OperationKind::Counteract,
            pool.place_up_to(OperationKind::Counteract, threads),
        );
        let mut dispatcher = Dispatcher::new(ctx.cluster, survey.now);
        dispatcher
            .dispatch_ops(&entry.hostname, OperationTag::Throughput, &ops)
            .await;
        debug!(target_host = %entry.hostname, threads, "throughput wave dispatched");

        let mut status = StatusSnapshot::empty(ModeKind::Throughput, survey.now);
        status.targets = vec![TargetStatus::action(
            &entry.hostname,
            entry.score,
            OperationKind::Counteract,
        )];
        status.dispatched_ops = dispatcher.dispatched();
        status.rejected_ops = dispatcher.rejected();
        status.income_per_sec = income;
        CycleResult::new(status, interval(config))
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// One greedy extraction pass over every target, richest first. The
/// daemon exits after it.
#[derive(Debug, Default)]
pub struct DrainMode;

impl DrainMode {
    pub async fn run_cycle(&mut self, ctx: &mut CycleContext<'_>, config: &Config) -> CycleResult {
        let survey = match survey_fleet(ctx, config, ModeKind::Drain).await {
            Ok(s) => s,
            Err(result) => return result.finished(),
        };
        let income = ctx.income.smoothed_rate();
        let scored = top_targets(ctx, config).await.unwrap_or_else(|e| {
            warn!(error = %e, "target scoring failed");
            Vec::new()
        });
        let mut readable = read_targets(ctx, &scored).await;
        if readable.is_empty() {
            return no_targets(ModeKind::Drain, survey.now, income, config).finished();
        }
        readable.sort_by(|(_, a), (_, b)| {
            b.current_yield
                .partial_cmp(&a.current_yield)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut pool = survey.pool(config);
        let mut dispatcher = Dispatcher::new(ctx.cluster, survey.now);
        let mut rows = Vec::with_capacity(readable.len());
        for (entry, snapshot) in &readable {
            rows.push(TargetStatus::action(&entry.hostname, entry.score, OperationKind::Extract));
            let threads = exhausting_extract_threads(snapshot);
            let ops = whole_op(
                OperationKind::Extract,
                pool.place_up_to(OperationKind::Extract, threads),
            );
            if ops.is_empty() {
                continue;
            }
            dispatcher
                .dispatch_ops(&entry.hostname, OperationTag::Drain, &ops)
                .await;
        }
        info!(
            targets = rows.len(),
            dispatched = dispatcher.dispatched(),
            "drain pass complete"
        );

        let mut status = StatusSnapshot::empty(ModeKind::Drain, survey.now);
        status.targets = rows;
        status.dispatched_ops = dispatcher.dispatched();
        status.rejected_ops = dispatcher.rejected();
        status.income_per_sec = income;
        CycleResult::new(status, interval(config)).finished()
    }
}
