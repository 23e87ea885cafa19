//! The target state machine: one [`TargetState`] per tracked target.
//!
//! The table is owned by the batch engine and lent by reference to the
//! planner and the tracker. Entries are inserted when a target first shows
//! up in a scoring pass and removed only when it has dropped out of scoring
//! *and* has no batches in flight.

use ahash::{AHashMap, AHashSet};
use cd_core::types::{ScoredTarget, TargetPhase, TargetState};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Targets added and removed by one [`TargetTable::sync_scores`] pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TargetTable {
    targets: AHashMap<String, TargetState>,
    /// Tracked targets missing from the latest scoring pass. They stay only
    /// until their in-flight batches land and get no new batches.
    unscored: AHashSet<String>,
}

impl TargetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, hostname: &str) -> Option<&TargetState> {
        self.targets.get(hostname)
    }

    /// Whether the target is tracked and was in the latest scoring pass.
    pub fn is_scored(&self, hostname: &str) -> bool {
        self.targets.contains_key(hostname) && !self.unscored.contains(hostname)
    }

    /// Apply a scoring pass: refresh scores, insert newcomers in `prep`, and
    /// drop absentees that have nothing in flight.
    pub fn sync_scores(&mut self, scored: &[ScoredTarget], operation_fraction: f64) -> SyncReport {
        let mut report = SyncReport::default();

        for entry in scored {
            match self.targets.get_mut(&entry.hostname) {
                Some(state) => {
                    state.score = entry.score;
                    state.operation_fraction = operation_fraction;
                }
                None => {
                    debug!(
                        target_host = %entry.hostname,
                        score = entry.score,
                        "tracking new target"
                    );
                    self.targets.insert(
                        entry.hostname.clone(),
                        TargetState::new(&entry.hostname, entry.score, operation_fraction),
                    );
                    report.added.push(entry.hostname.clone());
                }
            }
        }

        let unscored = &mut self.unscored;
        unscored.clear();
        self.targets.retain(|hostname, state| {
            let listed = scored.iter().any(|s| &s.hostname == hostname);
            if !listed {
                if state.active_batches == 0 {
                    report.removed.push(hostname.clone());
                    return false;
                }
                unscored.insert(hostname.clone());
            }
            true
        });
        report.removed.sort();

        if !report.removed.is_empty() {
            info!(removed = ?report.removed, "stopped tracking targets");
        }
        report
    }

    /// Insert a target recovered from live processes. Batches are already
    /// running against it, so it starts in `batch`.
    pub fn ensure_recovered(
        &mut self,
        hostname: &str,
        operation_fraction: f64,
    ) -> &mut TargetState {
        self.targets.entry(hostname.to_string()).or_insert_with(|| {
            info!(target_host = %hostname, "tracking target recovered from live batches");
            let mut state = TargetState::new(hostname, 0.0, operation_fraction);
            state.phase = TargetPhase::Batch;
            state
        })
    }

    /// Hostnames ordered by score, best first. Ties break on hostname so the
    /// planner order is deterministic.
    pub fn ordered(&self) -> Vec<String> {
        let mut states: Vec<&TargetState> = self.targets.values().collect();
        states.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hostname.cmp(&b.hostname))
        });
        states.into_iter().map(|s| s.hostname.clone()).collect()
    }

    pub fn set_prep_progress(&mut self, hostname: &str, progress: f64) {
        if let Some(state) = self.targets.get_mut(hostname) {
            state.prep_progress = progress.clamp(0.0, 1.0);
        }
    }

    fn transition(&mut self, hostname: &str, next: TargetPhase) -> Option<&mut TargetState> {
        let state = self.targets.get_mut(hostname)?;
        if !state.phase.can_transition_to(&next) {
            warn!(
                target_host = %hostname,
                from = ?state.phase,
                to = ?next,
                "ignoring invalid phase transition"
            );
            return None;
        }
        info!(target_host = %hostname, from = ?state.phase, to = ?next, "target phase transition");
        state.phase = next;
        Some(state)
    }

    /// `prep -> batch`.
    pub fn begin_batching(&mut self, hostname: &str) -> bool {
        match self.transition(hostname, TargetPhase::Batch) {
            Some(state) => {
                state.prep_progress = 1.0;
                true
            }
            None => false,
        }
    }

    /// `batch -> desync-recovery`; the offending batch counts as failed.
    pub fn mark_desync(&mut self, hostname: &str) -> bool {
        match self.transition(hostname, TargetPhase::DesyncRecovery) {
            Some(state) => {
                state.total_failed += 1;
                true
            }
            None => false,
        }
    }

    /// `desync-recovery -> prep`, once live work has been killed and the
    /// in-flight records discarded.
    pub fn finish_recovery(&mut self, hostname: &str) -> bool {
        match self.transition(hostname, TargetPhase::Prep) {
            Some(state) => {
                state.active_batches = 0;
                state.desync_count += 1;
                state.prep_progress = 0.0;
                state.last_batch_land_time = None;
                true
            }
            None => false,
        }
    }

    /// A batch for `hostname` was dispatched and registered with the tracker.
    pub fn record_dispatch(&mut self, hostname: &str, expected_end: DateTime<Utc>) {
        if let Some(state) = self.targets.get_mut(hostname) {
            state.active_batches += 1;
            state.last_batch_land_time = Some(
                state
                    .last_batch_land_time
                    .map_or(expected_end, |prev| prev.max(expected_end)),
            );
        }
    }

    /// A batch for `hostname` reconciled as landed.
    pub fn record_landed(&mut self, hostname: &str) {
        if let Some(state) = self.targets.get_mut(hostname) {
            state.active_batches = state.active_batches.saturating_sub(1);
            state.total_landed += 1;
        }
    }

    /// Overwrite the in-flight count from the tracker's authoritative view.
    pub fn set_active_batches(
        &mut self,
        hostname: &str,
        count: u32,
        last_end: Option<DateTime<Utc>>,
    ) {
        if let Some(state) = self.targets.get_mut(hostname) {
            state.active_batches = count;
            if last_end.is_some() {
                state.last_batch_land_time = last_end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scored(pairs: &[(&str, f64)]) -> Vec<ScoredTarget> {
        pairs.iter().map(|(h, s)| ScoredTarget::new(*h, *s)).collect()
    }

    #[test]
    fn sync_inserts_new_targets_in_prep() {
        let mut table = TargetTable::new();
        let report = table.sync_scores(&scored(&[("alpha", 0.9), ("beta", 0.4)]), 0.1);

        assert_eq!(report.added, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(table.get("alpha").map(|s| s.phase), Some(TargetPhase::Prep));
        assert_eq!(table.ordered(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn absent_target_with_batches_in_flight_is_kept() {
        let mut table = TargetTable::new();
        table.sync_scores(&scored(&[("alpha", 0.9), ("beta", 0.4)]), 0.1);
        table.record_dispatch("alpha", Utc::now());

        let report = table.sync_scores(&[], 0.1);
        assert_eq!(report.removed, vec!["beta".to_string()]);
        assert!(table.get("alpha").is_some(), "in-flight target must not be dropped");
        assert!(!table.is_scored("alpha"), "kept only to let its batches land");

        table.record_landed("alpha");
        let report = table.sync_scores(&[], 0.1);
        assert_eq!(report.removed, vec!["alpha".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn rescored_target_is_plannable_again() {
        let mut table = TargetTable::new();
        table.sync_scores(&scored(&[("alpha", 0.9)]), 0.1);
        assert!(table.is_scored("alpha"));
        table.record_dispatch("alpha", Utc::now());

        table.sync_scores(&[], 0.1);
        assert!(!table.is_scored("alpha"));

        table.sync_scores(&scored(&[("alpha", 0.7)]), 0.1);
        assert!(table.is_scored("alpha"));
        assert!(!table.is_scored("missing"));
    }

    #[test]
    fn full_lifecycle_updates_counters() {
        let mut table = TargetTable::new();
        table.sync_scores(&scored(&[("alpha", 0.9)]), 0.1);

        assert!(table.begin_batching("alpha"));
        let end = Utc::now() + Duration::seconds(40);
        table.record_dispatch("alpha", end);
        table.record_dispatch("alpha", end - Duration::seconds(1));
        let state = table.get("alpha").expect("alpha");
        assert_eq!(state.active_batches, 2);
        assert_eq!(state.last_batch_land_time, Some(end));

        assert!(table.mark_desync("alpha"));
        assert!(table.finish_recovery("alpha"));
        let state = table.get("alpha").expect("alpha");
        assert_eq!(state.phase, TargetPhase::Prep);
        assert_eq!(state.active_batches, 0);
        assert_eq!(state.total_failed, 1);
        assert_eq!(state.desync_count, 1);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let mut table = TargetTable::new();
        table.sync_scores(&scored(&[("alpha", 0.9)]), 0.1);
        assert!(!table.mark_desync("alpha"), "prep cannot desync");
        assert!(!table.finish_recovery("alpha"));
        assert!(!table.begin_batching("missing"));
    }

    #[test]
    fn landed_never_underflows() {
        let mut table = TargetTable::new();
        table.sync_scores(&scored(&[("alpha", 0.9)]), 0.1);
        table.record_landed("alpha");
        assert_eq!(table.get("alpha").map(|s| s.active_batches), Some(0));
    }
}
