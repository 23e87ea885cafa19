//! The batch engine: one cycle of reconcile, plan, pack, dispatch.

use std::time::Duration as StdDuration;

use ahash::AHashSet;
use cd_core::config::Config;
use cd_core::tag::OperationTag;
use cd_core::types::{BatchId, ModeKind, Node, StatusSnapshot, TargetPhase, TargetStatus};
use cd_telemetry::metrics::{
    global_metrics, BATCHES_DESYNCED, BATCHES_DISPATCHED, BATCHES_LANDED, BATCHES_UNPLACED,
    OUTSTANDING_BATCHES,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::allocator::pack_batches;
use crate::cluster::Cluster;
use crate::desync::{DesyncPolicy, ToleranceDesyncPolicy};
use crate::dispatcher::Dispatcher;
use crate::live::LiveIndex;
use crate::modes::{survey_fleet, top_targets, CycleContext, CycleResult, NO_ELIGIBLE_TARGETS};
use crate::planner::{self, BatchPlanner, PlannedBatch, PrepWave};
use crate::targets::TargetTable;
use crate::tracker::{Batch, BatchTracker, ReconcileReport};

/// Owns the target table, the outstanding-batch tracker and the id
/// counter. Nothing else mutates them.
pub struct BatchEngine {
    targets: TargetTable,
    tracker: BatchTracker,
    planner: BatchPlanner,
    /// `None` uses [`ToleranceDesyncPolicy`] built from the current config.
    policy: Option<Box<dyn DesyncPolicy>>,
    reconstructed: bool,
}

impl BatchEngine {
    pub fn new() -> Self {
        Self {
            targets: TargetTable::new(),
            tracker: BatchTracker::new(),
            planner: BatchPlanner::new(),
            policy: None,
            reconstructed: false,
        }
    }

    pub fn with_policy(policy: Box<dyn DesyncPolicy>) -> Self {
        Self {
            policy: Some(policy),
            ..Self::new()
        }
    }

    pub fn targets(&self) -> &TargetTable {
        &self.targets
    }

    pub fn tracker(&self) -> &BatchTracker {
        &self.tracker
    }

    pub fn next_batch_id(&self) -> BatchId {
        self.planner.next_id()
    }

    /// Rebuild in-flight state from the live process list. Returns how many
    /// batches were recovered; a second call right after the first returns 0
    /// and changes nothing.
    pub async fn reconstruct(
        &mut self,
        cluster: &dyn Cluster,
        nodes: &[Node],
        config: &Config,
        now: DateTime<Utc>,
    ) -> usize {
        let live = LiveIndex::scan(cluster, nodes).await;
        let report = self
            .tracker
            .reconstruct(cluster, &live, &config.batch, now)
            .await;

        for target in report.targets() {
            self.targets
                .ensure_recovered(&target, config.batch.extraction_fraction);
            self.targets.set_active_batches(
                &target,
                self.tracker.count_for(&target),
                self.tracker.last_end_for(&target),
            );
        }
        if let Some(max_id) = report.max_batch_id {
            self.planner.advance_past(max_id);
        }
        self.reconstructed = true;
        report.recovered.len()
    }

    pub async fn run_cycle(&mut self, ctx: &mut CycleContext<'_>, config: &Config) -> CycleResult {
        let survey = match survey_fleet(ctx, config, ModeKind::Batch).await {
            Ok(s) => s,
            Err(result) => return result,
        };
        let now = survey.now;
        let grace = Duration::milliseconds(config.batch.grace_period_ms as i64);

        if !self.reconstructed {
            self.reconstruct(ctx.cluster, &survey.nodes, config, now).await;
        }

        match top_targets(ctx, config).await {
            Ok(scored) => {
                self.targets
                    .sync_scores(&scored, config.batch.extraction_fraction);
            }
            Err(e) => warn!(error = %e, "target scoring failed, keeping current targets"),
        }

        let live = LiveIndex::scan(ctx.cluster, &survey.nodes).await;

        let report = {
            let default_policy;
            let policy: &dyn DesyncPolicy = match &self.policy {
                Some(p) => p.as_ref(),
                None => {
                    default_policy = ToleranceDesyncPolicy::from_config(&config.batch);
                    &default_policy
                }
            };
            self.tracker.reconcile(ctx.cluster, policy, &live, now, &config.batch).await
        };
        if !report.deferred.is_empty() {
            debug!(deferred = ?report.deferred, "due batches left outstanding");
        }
        let cleared = self.apply_reconcile(ctx, &report, &live, now).await;

        if self.targets.is_empty() {
            let mut status =
                StatusSnapshot::empty(ModeKind::Batch, now).with_error(NO_ELIGIBLE_TARGETS);
            status.income_per_sec = ctx.income.smoothed_rate();
            return CycleResult::backoff(status, config);
        }

        let (batches, waves) = self
            .plan(ctx.cluster, &live, &cleared, survey.allocation.total_capacity, config, now)
            .await;

        let mut pool = survey.pool(config);
        let (placed, unplaced) = pack_batches(&mut pool, batches);
        if !unplaced.is_empty() {
            global_metrics().increment_counter_by(BATCHES_UNPLACED, &[], unplaced.len() as u64);
            debug!(unplaced = unplaced.len(), "batches left for next cycle");
        }
        let prep: Vec<_> = waves
            .iter()
            .map(|wave| (wave.target.clone(), pool.place_prep(wave)))
            .filter(|(_, ops)| !ops.is_empty())
            .collect();

        let mut dispatcher = Dispatcher::new(ctx.cluster, now);
        for placed_batch in &placed {
            let Some(ops) = dispatcher.dispatch_batch(placed_batch).await else {
                continue;
            };
            let batch = &placed_batch.batch;
            self.tracker.register(Batch {
                id: batch.id,
                target: batch.target.clone(),
                ops,
                dispatched_at: now,
                expected_end: batch.expected_end,
                operation_fraction: batch.operation_fraction,
                recovered: false,
            });
            self.targets.record_dispatch(&batch.target, batch.expected_end);
            global_metrics()
                .increment_counter(BATCHES_DISPATCHED, &[("target", batch.target.as_str())]);
        }
        for (target, ops) in &prep {
            dispatcher.dispatch_ops(target, OperationTag::Prep, ops).await;
        }

        global_metrics().set_gauge(OUTSTANDING_BATCHES, self.tracker.len() as f64);

        let mut status = StatusSnapshot::empty(ModeKind::Batch, now);
        status.targets = self
            .targets
            .ordered()
            .iter()
            .filter_map(|host| self.targets.get(host))
            .map(TargetStatus::from)
            .collect();
        status.outstanding_batches = self.tracker.len();
        status.dispatched_ops = dispatcher.dispatched();
        status.rejected_ops = dispatcher.rejected();
        status.income_per_sec = ctx.income.smoothed_rate();

        CycleResult::new(status, self.sleep_after(now, grace, config))
    }

    /// Book landed batches and recover desynced targets. Returns the
    /// targets whose live work was killed this cycle.
    async fn apply_reconcile(
        &mut self,
        ctx: &mut CycleContext<'_>,
        report: &ReconcileReport,
        live: &LiveIndex,
        now: DateTime<Utc>,
    ) -> AHashSet<String> {
        for landed in &report.landed {
            let target = landed.batch.target.as_str();
            self.targets.record_landed(target);
            ctx.income.record(now, landed.income);
            global_metrics().increment_counter(BATCHES_LANDED, &[("target", target)]);
        }

        let mut cleared = AHashSet::new();
        for target in report.desynced_targets() {
            global_metrics().increment_counter(BATCHES_DESYNCED, &[("target", target.as_str())]);
            if !self.targets.mark_desync(&target) {
                continue;
            }
            let mut killed = 0usize;
            for process in live.for_target(&target) {
                match ctx.cluster.kill_process(&process.node, process.pid).await {
                    Ok(()) => killed += 1,
                    Err(e) => warn!(
                        target_host = %target,
                        node = %process.node,
                        pid = process.pid,
                        error = %e,
                        "failed to kill process during desync recovery"
                    ),
                }
            }
            let discarded = self.tracker.discard_target(&target);
            self.targets.finish_recovery(&target);
            info!(
                target_host = %target,
                killed,
                discarded = discarded.len(),
                "desync recovery complete, target back to prep"
            );
            cleared.insert(target);
        }
        cleared
    }

    /// Plan batches and prep waves for every target, best score first.
    async fn plan(
        &mut self,
        cluster: &dyn Cluster,
        live: &LiveIndex,
        cleared: &AHashSet<String>,
        total_capacity: f64,
        config: &Config,
        now: DateTime<Utc>,
    ) -> (Vec<PlannedBatch>, Vec<PrepWave>) {
        let mut batches = Vec::new();
        let mut waves = Vec::new();

        for host in self.targets.ordered() {
            let Some(phase) = self.targets.get(&host).map(|s| s.phase) else {
                continue;
            };
            if phase == TargetPhase::DesyncRecovery || !self.targets.is_scored(&host) {
                continue;
            }
            let snapshot = match cluster.target(&host).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        target_host = %host,
                        error = %e,
                        "target read failed, skipping this cycle"
                    );
                    continue;
                }
            };

            if phase == TargetPhase::Prep {
                self.targets.set_prep_progress(&host, snapshot.prep_progress());
                let prep_live =
                    !cleared.contains(&host) && live.has_tagged(&host, OperationTag::Prep);
                if prep_live {
                    continue;
                }
                let at_baseline = snapshot.is_at_baseline(
                    config.batch.yield_tolerance,
                    config.batch.defense_tolerance,
                );
                if !at_baseline {
                    if let Some(wave) = planner::plan_prep(&snapshot, &config.batch) {
                        waves.push(wave);
                    }
                    continue;
                }
                self.targets.begin_batching(&host);
            }

            let Some(state) = self.targets.get(&host) else {
                continue;
            };
            let ceiling = planner::max_batches_per_target(&config.batch, total_capacity, &snapshot);
            batches.extend(
                self.planner
                    .plan_batches(state, &snapshot, ceiling, &config.batch, now),
            );
        }

        (batches, waves)
    }

    fn sleep_after(&self, now: DateTime<Utc>, grace: Duration, config: &Config) -> StdDuration {
        let max = StdDuration::from_millis(config.daemon.cycle_interval_ms);
        let min = StdDuration::from_millis(config.daemon.min_sleep_ms).min(max);
        match self.tracker.next_due(grace) {
            Some(due) => {
                let wait = (due - now).to_std().unwrap_or(StdDuration::ZERO);
                wait.clamp(min, max)
            }
            None => max,
        }
    }
}

impl Default for BatchEngine {
    fn default() -> Self {
        Self::new()
    }
}
