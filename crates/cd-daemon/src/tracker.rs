//! Outstanding batches, their reconciliation against the clock, and their
//! reconstruction from the live process list after a restart.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use cd_core::config::BatchConfig;
use cd_core::types::{BatchId, OperationKind, Pid, TargetSnapshot};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::desync::DesyncPolicy;
use crate::live::LiveIndex;
use crate::planner;

/// One launched process belonging to a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOp {
    pub kind: OperationKind,
    pub node: String,
    pub pid: Pid,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub target: String,
    pub ops: Vec<TrackedOp>,
    pub dispatched_at: DateTime<Utc>,
    pub expected_end: DateTime<Utc>,
    /// Fraction of max yield this batch takes when it lands.
    pub operation_fraction: f64,
    /// Synthesized from live processes rather than dispatched by this run.
    pub recovered: bool,
}

impl Batch {
    pub fn is_due(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now >= self.expected_end + grace
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LandedBatch {
    pub batch: Batch,
    pub income: f64,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub landed: Vec<LandedBatch>,
    pub desynced: Vec<Batch>,
    /// Due batches left outstanding: their target could not be read, or a
    /// later batch was landing while their own work was still live.
    pub deferred: Vec<BatchId>,
}

impl ReconcileReport {
    /// Targets with at least one desynced batch, in first-seen order.
    pub fn desynced_targets(&self) -> Vec<String> {
        let mut seen = AHashSet::new();
        self.desynced
            .iter()
            .filter(|b| seen.insert(b.target.clone()))
            .map(|b| b.target.clone())
            .collect()
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ReconstructReport {
    /// `(batch id, target)` of every batch synthesized by this pass.
    pub recovered: Vec<(BatchId, String)>,
    pub max_batch_id: Option<BatchId>,
}

impl ReconstructReport {
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.recovered.iter().map(|(_, t)| t.clone()).collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

fn grace(config: &BatchConfig) -> Duration {
    Duration::milliseconds(config.grace_period_ms as i64)
}

/// Sole owner of the outstanding-batch map.
#[derive(Debug, Default)]
pub struct BatchTracker {
    outstanding: BTreeMap<BatchId, Batch>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn get(&self, id: BatchId) -> Option<&Batch> {
        self.outstanding.get(&id)
    }

    pub fn register(&mut self, batch: Batch) {
        debug!(
            batch_id = batch.id,
            target_host = %batch.target,
            expected_end = %batch.expected_end,
            "tracking batch"
        );
        self.outstanding.insert(batch.id, batch);
    }

    pub fn count_for(&self, target: &str) -> u32 {
        self.outstanding.values().filter(|b| b.target == target).count() as u32
    }

    pub fn last_end_for(&self, target: &str) -> Option<DateTime<Utc>> {
        self.outstanding
            .values()
            .filter(|b| b.target == target)
            .map(|b| b.expected_end)
            .max()
    }

    /// The earliest instant any outstanding batch becomes due.
    pub fn next_due(&self, grace: Duration) -> Option<DateTime<Utc>> {
        self.outstanding.values().map(|b| b.expected_end + grace).min()
    }

    /// Drop every outstanding batch for `target`.
    pub fn discard_target(&mut self, target: &str) -> Vec<Batch> {
        let ids: Vec<BatchId> = self
            .outstanding
            .values()
            .filter(|b| b.target == target)
            .map(|b| b.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.outstanding.remove(&id))
            .collect()
    }

    /// Whether no batch for `target` that is still short of due has started
    /// landing by `now`. Only then does the target state reflect the due
    /// batches alone.
    fn is_quiet(&self, target: &str, now: DateTime<Utc>, config: &BatchConfig) -> bool {
        let grace = grace(config);
        !self.outstanding.values().any(|b| {
            b.target == target
                && !b.is_due(now, grace)
                && planner::first_landing(b.expected_end, config) <= now
        })
    }

    /// Settle every batch that is due at `now`.
    ///
    /// Each target is read at most once per call. Once one of a target's
    /// batches desyncs, its remaining due batches are left for the caller
    /// to discard with the rest of the target's work.
    ///
    /// A late call can find a later batch for the same target already
    /// landing, which moves the target off baseline regardless of how the
    /// due batch went. The observed state is then not evidence against the
    /// due batch: it is credited as landed once none of its own processes
    /// are live, and left outstanding otherwise.
    pub async fn reconcile(
        &mut self,
        cluster: &dyn Cluster,
        policy: &dyn DesyncPolicy,
        live: &LiveIndex,
        now: DateTime<Utc>,
        config: &BatchConfig,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let grace = grace(config);
        let due: Vec<BatchId> = self
            .outstanding
            .values()
            .filter(|b| b.is_due(now, grace))
            .map(|b| b.id)
            .collect();
        if due.is_empty() {
            return report;
        }

        let mut snapshots: AHashMap<String, Option<TargetSnapshot>> = AHashMap::new();
        let mut quiet: AHashMap<String, bool> = AHashMap::new();
        let mut desynced_targets: AHashSet<String> = AHashSet::new();

        for id in due {
            let Some(target) = self.outstanding.get(&id).map(|b| b.target.clone()) else {
                continue;
            };
            if desynced_targets.contains(&target) {
                continue;
            }

            if !snapshots.contains_key(&target) {
                let snapshot = match cluster.target(&target).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(
                            target_host = %target,
                            error = %e,
                            "target read failed, deferring reconciliation"
                        );
                        None
                    }
                };
                snapshots.insert(target.clone(), snapshot);
                quiet.insert(target.clone(), self.is_quiet(&target, now, config));
            }
            let Some(observed) = snapshots.get(&target).and_then(|s| s.as_ref()) else {
                report.deferred.push(id);
                continue;
            };

            if !quiet.get(&target).copied().unwrap_or(true) {
                if live.has_batch(id) {
                    debug!(
                        batch_id = id,
                        target_host = %target,
                        "later batch landing and own work still live, deferring"
                    );
                    report.deferred.push(id);
                    continue;
                }
                let Some(batch) = self.outstanding.remove(&id) else {
                    continue;
                };
                let income = observed.max_yield * batch.operation_fraction;
                debug!(
                    batch_id = batch.id,
                    target_host = %batch.target,
                    income,
                    "batch finished while a later batch was landing, credited"
                );
                report.landed.push(LandedBatch { batch, income });
                continue;
            }

            let Some(batch) = self.outstanding.remove(&id) else {
                continue;
            };
            if policy.is_desynced(&batch, observed) {
                warn!(
                    batch_id = batch.id,
                    target_host = %batch.target,
                    current_yield = observed.current_yield,
                    current_defense = observed.current_defense,
                    "batch desynced"
                );
                desynced_targets.insert(target);
                report.desynced.push(batch);
            } else {
                let income = observed.max_yield * batch.operation_fraction;
                debug!(batch_id = batch.id, target_host = %batch.target, income, "batch landed");
                report.landed.push(LandedBatch { batch, income });
            }
        }

        report
    }

    /// Rebuild outstanding batches from batch-tagged live processes.
    ///
    /// Batches already tracked are left alone, so running this twice in a
    /// row changes nothing the second time.
    pub async fn reconstruct(
        &mut self,
        cluster: &dyn Cluster,
        live: &LiveIndex,
        config: &BatchConfig,
        now: DateTime<Utc>,
    ) -> ReconstructReport {
        let mut report = ReconstructReport {
            recovered: Vec::new(),
            max_batch_id: live.max_batch_id(),
        };
        let mut round_trips: AHashMap<String, Duration> = AHashMap::new();
        let fallback = Duration::milliseconds(config.recovery_round_trip_ms as i64);

        for (id, processes) in live.batch_groups() {
            if self.outstanding.contains_key(&id) {
                continue;
            }
            let Some(first) = processes.first() else {
                continue;
            };
            let target = first.target.clone();

            if !round_trips.contains_key(&target) {
                let round_trip = match cluster.target(&target).await {
                    Ok(snapshot) => planner::round_trip(&snapshot, config),
                    Err(e) => {
                        warn!(
                            target_host = %target,
                            error = %e,
                            fallback_ms = config.recovery_round_trip_ms,
                            "recovered target unreadable, using fallback round trip"
                        );
                        fallback
                    }
                };
                round_trips.insert(target.clone(), round_trip);
            }
            let round_trip = round_trips.get(&target).copied().unwrap_or(fallback);

            let dispatched_at = processes
                .iter()
                .map(|p| p.dispatched_at)
                .min()
                .unwrap_or(now);
            let ops = processes
                .iter()
                .map(|p| TrackedOp {
                    kind: p.kind,
                    node: p.node.clone(),
                    pid: p.pid,
                    threads: p.threads,
                })
                .collect();

            self.outstanding.insert(
                id,
                Batch {
                    id,
                    target: target.clone(),
                    ops,
                    dispatched_at,
                    expected_end: now + round_trip,
                    operation_fraction: config.extraction_fraction,
                    recovered: true,
                },
            );
            report.recovered.push((id, target));
        }

        if !report.recovered.is_empty() {
            info!(
                batches = report.recovered.len(),
                max_batch_id = ?report.max_batch_id,
                "reconstructed in-flight batches from live processes"
            );
        }
        report
    }
}
