//! Batch planning: thread counts and launch delays so that one batch's four
//! completions land in a fixed order inside one window.
//!
//! Landing order within a window of width `4 * step`, relative to the
//! batch's base instant, with `W` the counteract duration:
//!
//! ```text
//! extract      lands at W
//! counteract   lands at W + step     (cancels the extract's defense rise)
//! restore      lands at W + 2 step
//! counteract   lands at W + 3 step   (cancels the restore's defense rise)
//! ```
//!
//! Because the duration ratios between kinds are fixed, every delay is a
//! constant offset from the dispatch instant.

use cd_core::config::BatchConfig;
use cd_core::tag::OperationTag;
use cd_core::types::{BatchId, OperationKind, TargetSnapshot, TargetState};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Fleet-size thresholds for `max_batches_per_target = 0`, largest first.
const AUTO_CEILINGS: [(f64, u32); 4] = [(16_384.0, 64), (4_096.0, 32), (1_024.0, 12), (0.0, 4)];

/// Highest extraction fraction the planner will size for. Taking everything
/// makes the restore unsizable.
const MAX_TAKEN_FRACTION: f64 = 0.99;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOp {
    pub kind: OperationKind,
    pub threads: u32,
    pub launch_delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch {
    pub id: BatchId,
    pub target: String,
    /// In landing order: extract, counteract, restore, counteract.
    pub ops: Vec<PlannedOp>,
    pub expected_end: DateTime<Utc>,
    pub operation_fraction: f64,
}

impl PlannedBatch {
    pub fn tag(&self) -> OperationTag {
        OperationTag::Batch(self.id)
    }
}

/// Non-extractive operations that drive a target to its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepWave {
    pub target: String,
    pub ops: Vec<PlannedOp>,
}

/// Thread counts for one batch against a target at baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSizing {
    pub extract: u32,
    pub counteract_extract: u32,
    pub restore: u32,
    pub counteract_restore: u32,
    /// Fraction of max yield the extract threads actually remove.
    pub taken_fraction: f64,
}

/// Size a batch that extracts `fraction` of the target's maximum yield.
///
/// Returns `None` when any of the four operations would get zero threads.
pub fn size_batch(snapshot: &TargetSnapshot, fraction: f64) -> Option<BatchSizing> {
    let p = &snapshot.profile;
    if p.extract_fraction_per_thread <= 0.0
        || p.counteract_per_thread <= 0.0
        || p.restore_growth_per_thread <= 1.0
    {
        return None;
    }

    let extract = (fraction / p.extract_fraction_per_thread + EPSILON).floor() as u32;
    let taken_fraction = (extract as f64 * p.extract_fraction_per_thread).min(MAX_TAKEN_FRACTION);
    let counteract_extract =
        (extract as f64 * p.extract_defense_per_thread / p.counteract_per_thread - EPSILON).ceil()
            as u32;
    let restore = restore_threads(1.0 / (1.0 - taken_fraction), p.restore_growth_per_thread);
    let counteract_restore =
        (restore as f64 * p.restore_defense_per_thread / p.counteract_per_thread - EPSILON).ceil()
            as u32;

    let sizing = BatchSizing {
        extract,
        counteract_extract,
        restore,
        counteract_restore,
        taken_fraction,
    };
    if extract == 0 || counteract_extract == 0 || restore == 0 || counteract_restore == 0 {
        return None;
    }
    Some(sizing)
}

fn restore_threads(multiplier: f64, growth_per_thread: f64) -> u32 {
    if multiplier <= 1.0 {
        return 0;
    }
    (multiplier.ln() / growth_per_thread.ln() - EPSILON).ceil().max(0.0) as u32
}

fn counteract_threads(excess_defense: f64, per_thread: f64) -> u32 {
    if excess_defense <= EPSILON || per_thread <= 0.0 {
        return 0;
    }
    (excess_defense / per_thread - EPSILON).ceil() as u32
}

/// Time from dispatch of a batch to its last completion.
pub fn round_trip(snapshot: &TargetSnapshot, config: &BatchConfig) -> Duration {
    snapshot.duration(OperationKind::Counteract) + window(config)
}

fn window(config: &BatchConfig) -> Duration {
    Duration::milliseconds(config.batch_window_ms as i64)
}

fn step(config: &BatchConfig) -> Duration {
    Duration::milliseconds((config.batch_window_ms / 4) as i64)
}

/// When the first operation of a batch ending at `expected_end` lands.
/// From then until the batch ends, the target is off baseline on purpose.
pub fn first_landing(expected_end: DateTime<Utc>, config: &BatchConfig) -> DateTime<Utc> {
    expected_end - step(config) * 3
}

/// Ceiling used when `max_batches_per_target` is 0.
pub fn auto_ceiling(total_capacity: f64) -> u32 {
    AUTO_CEILINGS
        .iter()
        .find(|(threshold, _)| total_capacity >= *threshold)
        .map(|(_, ceiling)| *ceiling)
        .unwrap_or(1)
}

/// `min(configuredCeiling, floor(roundTripTime / batchWindow))`.
pub fn max_batches_per_target(
    config: &BatchConfig,
    total_capacity: f64,
    snapshot: &TargetSnapshot,
) -> u32 {
    let configured = if config.max_batches_per_target == 0 {
        auto_ceiling(total_capacity)
    } else {
        config.max_batches_per_target
    };
    let window_ms = config.batch_window_ms.max(1) as i64;
    let by_time = (round_trip(snapshot, config).num_milliseconds() / window_ms).max(0) as u32;
    configured.min(by_time)
}

/// Hands out batch ids and turns target state into planned batches.
#[derive(Debug)]
pub struct BatchPlanner {
    next_id: BatchId,
}

impl BatchPlanner {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// The id the next planned batch will get.
    pub fn next_id(&self) -> BatchId {
        self.next_id
    }

    /// Make sure future ids are strictly greater than `id`.
    pub fn advance_past(&mut self, id: BatchId) {
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    /// Plan as many batches as the target has spare slots for.
    ///
    /// Consecutive windows for one target never overlap: each new batch
    /// ends at least one window after the previous one, including batches
    /// already in flight (`last_batch_land_time`).
    pub fn plan_batches(
        &mut self,
        state: &TargetState,
        snapshot: &TargetSnapshot,
        ceiling: u32,
        config: &BatchConfig,
        now: DateTime<Utc>,
    ) -> Vec<PlannedBatch> {
        let spare = ceiling.saturating_sub(state.active_batches);
        if spare == 0 {
            return Vec::new();
        }

        let Some(sizing) = size_batch(snapshot, state.operation_fraction) else {
            debug!(
                target_host = %state.hostname,
                fraction = state.operation_fraction,
                "degenerate batch, a thread count rounds to zero"
            );
            return Vec::new();
        };

        let extract_time = snapshot.duration(OperationKind::Extract);
        let restore_time = snapshot.duration(OperationKind::Restore);
        let counteract_time = snapshot.duration(OperationKind::Counteract);
        let step = step(config);
        let window = window(config);

        let earliest_end = now + counteract_time + step * 3;
        let mut prev_end = state.last_batch_land_time;
        let mut planned = Vec::with_capacity(spare as usize);

        for _ in 0..spare {
            let end = match prev_end {
                Some(prev) => earliest_end.max(prev + window),
                None => earliest_end,
            };
            let shift = end - earliest_end;

            let ops = vec![
                PlannedOp {
                    kind: OperationKind::Extract,
                    threads: sizing.extract,
                    launch_delay: shift + counteract_time - extract_time,
                },
                PlannedOp {
                    kind: OperationKind::Counteract,
                    threads: sizing.counteract_extract,
                    launch_delay: shift + step,
                },
                PlannedOp {
                    kind: OperationKind::Restore,
                    threads: sizing.restore,
                    launch_delay: shift + counteract_time + step * 2 - restore_time,
                },
                PlannedOp {
                    kind: OperationKind::Counteract,
                    threads: sizing.counteract_restore,
                    launch_delay: shift + step * 3,
                },
            ];

            let id = self.next_id;
            self.next_id += 1;
            planned.push(PlannedBatch {
                id,
                target: state.hostname.clone(),
                ops,
                expected_end: end,
                operation_fraction: sizing.taken_fraction,
            });
            prev_end = Some(end);
        }

        debug!(
            target_host = %state.hostname,
            batches = planned.len(),
            extract = sizing.extract,
            restore = sizing.restore,
            "planned batches"
        );
        planned
    }
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Plan one prep wave bringing the target to minimum defense and maximum
/// yield. `None` when the target needs nothing.
pub fn plan_prep(snapshot: &TargetSnapshot, config: &BatchConfig) -> Option<PrepWave> {
    let p = &snapshot.profile;
    let counteract_first = counteract_threads(
        snapshot.current_defense - snapshot.min_defense,
        p.counteract_per_thread,
    );
    let needs_restore = snapshot.current_yield < snapshot.max_yield;
    let restore = if needs_restore && p.restore_growth_per_thread > 1.0 {
        restore_threads(
            snapshot.max_yield / snapshot.current_yield.max(1.0),
            p.restore_growth_per_thread,
        )
    } else {
        0
    };
    let counteract_second = counteract_threads(
        restore as f64 * p.restore_defense_per_thread,
        p.counteract_per_thread,
    );

    let restore_time = snapshot.duration(OperationKind::Restore);
    let counteract_time = snapshot.duration(OperationKind::Counteract);
    let step = step(config);

    let ops: Vec<PlannedOp> = [
        (OperationKind::Counteract, counteract_first, Duration::zero()),
        (
            OperationKind::Restore,
            restore,
            counteract_time + step - restore_time,
        ),
        (OperationKind::Counteract, counteract_second, step * 2),
    ]
    .into_iter()
    .filter(|(_, threads, _)| *threads > 0)
    .map(|(kind, threads, launch_delay)| PlannedOp {
        kind,
        threads,
        launch_delay,
    })
    .collect();

    if ops.is_empty() {
        return None;
    }
    Some(PrepWave {
        target: snapshot.hostname.clone(),
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_core::types::{TargetPhase, TargetProfile};

    fn snapshot() -> TargetSnapshot {
        TargetSnapshot {
            hostname: "alpha".into(),
            current_yield: 1_000_000.0,
            max_yield: 1_000_000.0,
            current_defense: 5.0,
            min_defense: 5.0,
            profile: TargetProfile::default(),
        }
    }

    fn batch_state() -> TargetState {
        let mut state = TargetState::new("alpha", 1.0, 0.1);
        state.phase = TargetPhase::Batch;
        state
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn sizing_matches_profile() {
        let sizing = size_batch(&snapshot(), 0.1).expect("sizable");
        assert_eq!(sizing.extract, 50);
        // 50 * 0.002 / 0.05 = 2
        assert_eq!(sizing.counteract_extract, 2);
        // ln(1/0.9) / ln(1.0025) = 42.2
        assert_eq!(sizing.restore, 43);
        // 43 * 0.004 / 0.05 = 3.44
        assert_eq!(sizing.counteract_restore, 4);
        assert!((sizing.taken_fraction - 0.1).abs() < 1e-9);
    }

    #[test]
    fn tiny_fraction_is_degenerate() {
        assert!(size_batch(&snapshot(), 0.001).is_none());
    }

    #[test]
    fn completions_land_in_order_within_one_window() {
        let config = BatchConfig::default();
        let snap = snapshot();
        let mut planner = BatchPlanner::new();
        let batches = planner.plan_batches(&batch_state(), &snap, 1, &config, now());
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];

        let landings: Vec<DateTime<Utc>> = batch
            .ops
            .iter()
            .map(|op| now() + op.launch_delay + snap.duration(op.kind))
            .collect();
        assert!(landings.windows(2).all(|w| w[0] < w[1]), "strict landing order");
        assert_eq!(*landings.last().expect("ops"), batch.expected_end);
        let spread = batch.expected_end - landings[0];
        assert!(spread < Duration::milliseconds(config.batch_window_ms as i64));
        assert!(batch.ops.iter().all(|op| op.launch_delay >= Duration::zero()));
    }

    #[test]
    fn ids_increase_and_windows_do_not_overlap() {
        let config = BatchConfig::default();
        let mut planner = BatchPlanner::new();
        let batches = planner.plan_batches(&batch_state(), &snapshot(), 3, &config, now());
        assert_eq!(batches.iter().map(|b| b.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        for pair in batches.windows(2) {
            assert_eq!(
                pair[1].expected_end - pair[0].expected_end,
                Duration::milliseconds(config.batch_window_ms as i64)
            );
        }
        assert_eq!(planner.next_id(), 4);
    }

    #[test]
    fn new_batches_stagger_after_in_flight_ones() {
        let config = BatchConfig::default();
        let mut state = batch_state();
        let far = now() + Duration::seconds(120);
        state.last_batch_land_time = Some(far);
        state.active_batches = 1;

        let mut planner = BatchPlanner::new();
        let batches = planner.plan_batches(&state, &snapshot(), 2, &config, now());
        assert_eq!(batches.len(), 1, "one spare slot");
        assert_eq!(batches[0].expected_end, far + Duration::milliseconds(1_000));
    }

    #[test]
    fn no_batches_when_ceiling_below_active() {
        let mut state = batch_state();
        state.active_batches = 5;
        let mut planner = BatchPlanner::new();
        let batches = planner.plan_batches(&state, &snapshot(), 3, &BatchConfig::default(), now());
        assert!(batches.is_empty());
        assert_eq!(planner.next_id(), 1, "no id consumed");
    }

    #[test]
    fn ceiling_is_bounded_by_round_trip() {
        let mut config = BatchConfig {
            max_batches_per_target: 100,
            ..BatchConfig::default()
        };
        // counteract 40s + window 1s = 41 windows
        assert_eq!(max_batches_per_target(&config, 0.0, &snapshot()), 41);
        config.max_batches_per_target = 6;
        assert_eq!(max_batches_per_target(&config, 0.0, &snapshot()), 6);
        config.max_batches_per_target = 0;
        assert_eq!(max_batches_per_target(&config, 5_000.0, &snapshot()), 32);
        assert_eq!(max_batches_per_target(&config, 10.0, &snapshot()), 4);
    }

    #[test]
    fn advance_past_only_moves_forward() {
        let mut planner = BatchPlanner::new();
        planner.advance_past(41);
        assert_eq!(planner.next_id(), 42);
        planner.advance_past(7);
        assert_eq!(planner.next_id(), 42);
    }

    #[test]
    fn prep_wave_targets_baseline() {
        let mut snap = snapshot();
        snap.current_defense = 15.0;
        snap.current_yield = 250_000.0;
        let wave = plan_prep(&snap, &BatchConfig::default()).expect("needs prep");

        let kinds: Vec<OperationKind> = wave.ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Counteract, OperationKind::Restore, OperationKind::Counteract]
        );
        assert_eq!(wave.ops[0].threads, 200);
        // ln(4) / ln(1.0025) = 555.2
        assert_eq!(wave.ops[1].threads, 556);
    }

    #[test]
    fn prepped_target_needs_no_wave() {
        assert!(plan_prep(&snapshot(), &BatchConfig::default()).is_none());
    }
}
