use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Remote process identifier returned by a successful invocation.
pub type Pid = u64;

/// Monotonic batch identifier.
pub type BatchId = u64;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// The three remote operations a worker thread can run against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Removes a fraction of the target's current yield.
    Extract,
    /// Lowers the target's defense.
    Counteract,
    /// Multiplies the target's yield back toward its maximum.
    Restore,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Extract,
        OperationKind::Counteract,
        OperationKind::Restore,
    ];

    /// Duration of this operation relative to an extraction against the
    /// same target. The ratios are fixed, which is what lets the planner
    /// precompute launch offsets.
    pub fn duration_ratio(self) -> f64 {
        match self {
            OperationKind::Extract => 1.0,
            OperationKind::Restore => 3.2,
            OperationKind::Counteract => 4.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Extract => "extract",
            OperationKind::Counteract => "counteract",
            OperationKind::Restore => "restore",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A compute node as reported by the node inventory. Refreshed every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub total_capacity: f64,
    pub free_capacity: f64,
}

impl Node {
    pub fn new(hostname: impl Into<String>, total_capacity: f64, free_capacity: f64) -> Self {
        Self {
            hostname: hostname.into(),
            total_capacity,
            free_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Static sizing parameters of a target, used to turn a desired effect into
/// thread counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Duration of one extraction at the target's current defense.
    pub extract_time_ms: u64,
    /// Fraction of current yield removed by one extract thread.
    pub extract_fraction_per_thread: f64,
    /// Defense added by one extract thread.
    pub extract_defense_per_thread: f64,
    /// Defense added by one restore thread.
    pub restore_defense_per_thread: f64,
    /// Defense removed by one counteract thread.
    pub counteract_per_thread: f64,
    /// Yield multiplier contributed by one restore thread (> 1.0).
    pub restore_growth_per_thread: f64,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            extract_time_ms: 10_000,
            extract_fraction_per_thread: 0.002,
            extract_defense_per_thread: 0.002,
            restore_defense_per_thread: 0.004,
            counteract_per_thread: 0.05,
            restore_growth_per_thread: 1.0025,
        }
    }
}

/// Live state of one target, read fresh from the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub hostname: String,
    pub current_yield: f64,
    pub max_yield: f64,
    pub current_defense: f64,
    pub min_defense: f64,
    pub profile: TargetProfile,
}

impl TargetSnapshot {
    /// How long an operation of `kind` takes against this target.
    pub fn duration(&self, kind: OperationKind) -> Duration {
        let ms = self.profile.extract_time_ms as f64 * kind.duration_ratio();
        Duration::milliseconds(ms.round() as i64)
    }

    /// `true` when yield and defense sit at their ideal baseline, within
    /// the given tolerances.
    pub fn is_at_baseline(&self, yield_tolerance: f64, defense_tolerance: f64) -> bool {
        self.current_yield >= self.max_yield * (1.0 - yield_tolerance)
            && self.current_defense <= self.min_defense + defense_tolerance
    }

    /// Progress toward baseline in `[0, 1]`.
    pub fn prep_progress(&self) -> f64 {
        let defense = if self.current_defense > 0.0 {
            (self.min_defense / self.current_defense).min(1.0)
        } else {
            1.0
        };
        let yield_part = if self.max_yield > 0.0 {
            (self.current_yield / self.max_yield).min(1.0)
        } else {
            1.0
        };
        ((defense + yield_part) / 2.0).clamp(0.0, 1.0)
    }
}

/// One entry of a target-scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTarget {
    pub hostname: String,
    pub score: f64,
}

impl ScoredTarget {
    pub fn new(hostname: impl Into<String>, score: f64) -> Self {
        Self {
            hostname: hostname.into(),
            score,
        }
    }
}

// ---------------------------------------------------------------------------
// TargetPhase / TargetState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPhase {
    /// Driving the target toward its baseline with non-extractive operations.
    Prep,
    /// Steady-state batched extraction.
    Batch,
    /// Transient: killing live work after a desync.
    DesyncRecovery,
}

impl TargetPhase {
    /// Returns `true` when a transition from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: &TargetPhase) -> bool {
        matches!(
            (self, next),
            (TargetPhase::Prep, TargetPhase::Batch)
                | (TargetPhase::Batch, TargetPhase::DesyncRecovery)
                | (TargetPhase::DesyncRecovery, TargetPhase::Prep)
        )
    }
}

/// Engine-owned bookkeeping for one target. Holds counters only, never
/// references to batch records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub hostname: String,
    pub phase: TargetPhase,
    pub score: f64,
    pub operation_fraction: f64,
    pub active_batches: u32,
    pub total_landed: u64,
    pub total_failed: u64,
    pub desync_count: u64,
    pub prep_progress: f64,
    pub last_batch_land_time: Option<DateTime<Utc>>,
}

impl TargetState {
    pub fn new(hostname: impl Into<String>, score: f64, operation_fraction: f64) -> Self {
        Self {
            hostname: hostname.into(),
            phase: TargetPhase::Prep,
            score,
            operation_fraction,
            active_batches: 0,
            total_landed: 0,
            total_failed: 0,
            desync_count: 0,
            prep_progress: 0.0,
            last_batch_land_time: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Fleet allocation
// ---------------------------------------------------------------------------

/// Capacity partition between this engine and the share workload.
/// Recomputed and republished wholesale every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetAllocation {
    pub hack_servers: Vec<String>,
    pub share_servers: Vec<String>,
    pub total_capacity: f64,
    pub hack_capacity: f64,
    pub share_capacity: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Remote invocation surface
// ---------------------------------------------------------------------------

/// Arguments of one remote invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub kind: OperationKind,
    pub node: String,
    pub threads: u32,
    pub target: String,
    pub launch_delay_ms: u64,
    pub dispatched_at: DateTime<Utc>,
    pub tag: String,
}

/// A remote operation still running somewhere in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveProcess {
    pub pid: Pid,
    pub node: String,
    pub kind: OperationKind,
    pub target: String,
    pub launch_delay_ms: u64,
    pub dispatched_at: DateTime<Utc>,
    pub tag: String,
    pub threads: u32,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Batch,
    Legacy,
    Throughput,
    Drain,
}

impl std::fmt::Display for ModeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModeKind::Batch => "batch",
            ModeKind::Legacy => "legacy",
            ModeKind::Throughput => "throughput",
            ModeKind::Drain => "drain",
        };
        f.write_str(s)
    }
}

/// Per-target row of a status snapshot. Modes without per-target state
/// leave `phase` empty and report the operation they chose instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub hostname: String,
    pub phase: Option<TargetPhase>,
    pub action: Option<OperationKind>,
    pub score: f64,
    pub active_batches: u32,
    pub total_landed: u64,
    pub total_failed: u64,
    pub desync_count: u64,
    pub prep_progress: f64,
}

impl TargetStatus {
    /// Row for a mode that acts on a target without tracking its lifecycle.
    pub fn action(hostname: impl Into<String>, score: f64, action: OperationKind) -> Self {
        Self {
            hostname: hostname.into(),
            phase: None,
            action: Some(action),
            score,
            active_batches: 0,
            total_landed: 0,
            total_failed: 0,
            desync_count: 0,
            prep_progress: 0.0,
        }
    }
}

impl From<&TargetState> for TargetStatus {
    fn from(state: &TargetState) -> Self {
        Self {
            hostname: state.hostname.clone(),
            phase: Some(state.phase),
            action: None,
            score: state.score,
            active_batches: state.active_batches,
            total_landed: state.total_landed,
            total_failed: state.total_failed,
            desync_count: state.desync_count,
            prep_progress: state.prep_progress,
        }
    }
}

/// The one structured snapshot every mode publishes per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub mode: ModeKind,
    pub timestamp: DateTime<Utc>,
    pub targets: Vec<TargetStatus>,
    pub outstanding_batches: usize,
    pub dispatched_ops: usize,
    pub rejected_ops: usize,
    pub income_per_sec: f64,
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn empty(mode: ModeKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            mode,
            timestamp,
            targets: Vec::new(),
            outstanding_batches: 0,
            dispatched_ops: 0,
            rejected_ops: 0,
            income_per_sec: 0.0,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
