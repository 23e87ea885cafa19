//! Fleet allocation in two stages.
//!
//! Stage 1 ([`partition`]) splits the fleet between this engine and the
//! share workload. Stage 2 ([`CapacityPool`]) bin-packs thread requests
//! into the free capacity of the engine's own nodes.

use cd_core::config::{FleetConfig, OperationsConfig};
use cd_core::types::{FleetAllocation, Node, OperationKind};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::planner::{PlannedBatch, PlannedOp, PrepWave};

const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Stage 1: share partition
// ---------------------------------------------------------------------------

/// Partition the fleet between the engine and the share workload.
///
/// Nodes are offered to the share workload smallest first until the next
/// one would push it past `share_percent` of total capacity. The primary
/// node always stays with the engine.
pub fn partition(nodes: &[Node], config: &FleetConfig, now: DateTime<Utc>) -> FleetAllocation {
    let total_capacity: f64 = nodes.iter().map(|n| n.total_capacity).sum();
    let share_budget = total_capacity * config.share_percent / 100.0;

    let mut ascending: Vec<&Node> = nodes.iter().collect();
    ascending.sort_by(|a, b| {
        a.total_capacity
            .partial_cmp(&b.total_capacity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hostname.cmp(&b.hostname))
    });

    let mut share_servers = Vec::new();
    let mut share_capacity = 0.0;
    if share_budget > 0.0 {
        for node in ascending {
            if node.hostname == config.primary_node {
                continue;
            }
            if share_capacity + node.total_capacity > share_budget + EPSILON {
                break;
            }
            share_capacity += node.total_capacity;
            share_servers.push(node.hostname.clone());
        }
    }

    let mut hack_servers: Vec<String> = nodes
        .iter()
        .filter(|n| !share_servers.contains(&n.hostname))
        .map(|n| n.hostname.clone())
        .collect();
    hack_servers.sort();

    FleetAllocation {
        hack_servers,
        share_servers,
        total_capacity,
        hack_capacity: total_capacity - share_capacity,
        share_capacity,
        timestamp: now,
    }
}

// ---------------------------------------------------------------------------
// Stage 2: bin packing
// ---------------------------------------------------------------------------

/// Threads of one operation assigned to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub node: String,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOp {
    pub kind: OperationKind,
    pub launch_delay: Duration,
    pub parts: Vec<Placement>,
}

impl PlacedOp {
    pub fn threads(&self) -> u32 {
        self.parts.iter().map(|p| p.threads).sum()
    }
}

/// A batch whose four operations all found capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedBatch {
    pub batch: PlannedBatch,
    pub ops: Vec<PlacedOp>,
}

#[derive(Debug, Clone)]
struct Slot {
    hostname: String,
    free: f64,
}

/// Free capacity of the engine's nodes, consumed as operations are placed.
///
/// Slots keep a fixed order, most free capacity first, so placement is
/// deterministic for a given fleet.
#[derive(Debug, Clone)]
pub struct CapacityPool {
    slots: Vec<Slot>,
    costs: OperationsConfig,
}

impl CapacityPool {
    /// Build the pool from the engine's share of the fleet. The primary
    /// node contributes its free capacity minus the reserve.
    pub fn new(
        nodes: &[Node],
        allocation: &FleetAllocation,
        fleet: &FleetConfig,
        costs: &OperationsConfig,
    ) -> Self {
        let slots = nodes
            .iter()
            .filter(|n| allocation.hack_servers.contains(&n.hostname))
            .map(|n| {
                let free = if n.hostname == fleet.primary_node {
                    n.free_capacity - fleet.reserved_primary_capacity
                } else {
                    n.free_capacity
                };
                (n.hostname.clone(), free)
            })
            .collect();
        Self::from_free(slots, costs)
    }

    /// Build the pool from explicit per-node free capacity.
    pub fn from_free(free: Vec<(String, f64)>, costs: &OperationsConfig) -> Self {
        let mut slots: Vec<Slot> = free
            .into_iter()
            .map(|(hostname, free)| Slot {
                hostname,
                free: free.max(0.0),
            })
            .collect();
        slots.sort_by(|a, b| {
            b.free
                .partial_cmp(&a.free)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.hostname.cmp(&b.hostname))
        });
        Self {
            slots,
            costs: costs.clone(),
        }
    }

    pub fn total_free(&self) -> f64 {
        self.slots.iter().map(|s| s.free).sum()
    }

    fn fit(&self, slot: &Slot, kind: OperationKind) -> u32 {
        let cost = self.costs.cost(kind);
        if cost <= 0.0 {
            return 0;
        }
        (slot.free / cost + EPSILON).floor().max(0.0) as u32
    }

    /// How many threads of `kind` the pool could still take in total.
    pub fn threads_available(&self, kind: OperationKind) -> u32 {
        self.slots.iter().map(|s| self.fit(s, kind)).sum()
    }

    fn take(&mut self, index: usize, kind: OperationKind, threads: u32) -> Placement {
        let cost = self.costs.cost(kind);
        let slot = &mut self.slots[index];
        slot.free = (slot.free - threads as f64 * cost).max(0.0);
        Placement {
            node: slot.hostname.clone(),
            threads,
        }
    }

    /// Place all `threads` or nothing. A single node is preferred; the
    /// operation is split across nodes only when none holds it whole.
    pub fn place(&mut self, kind: OperationKind, threads: u32) -> Option<Vec<Placement>> {
        if threads == 0 {
            return Some(Vec::new());
        }
        if let Some(index) =
            (0..self.slots.len()).find(|&i| self.fit(&self.slots[i], kind) >= threads)
        {
            return Some(vec![self.take(index, kind, threads)]);
        }
        if self.threads_available(kind) < threads {
            return None;
        }
        Some(self.place_up_to(kind, threads))
    }

    /// Place as many of `threads` as fit, greedily across nodes.
    pub fn place_up_to(&mut self, kind: OperationKind, threads: u32) -> Vec<Placement> {
        let mut remaining = threads;
        let mut parts = Vec::new();
        for index in 0..self.slots.len() {
            if remaining == 0 {
                break;
            }
            let fits = self.fit(&self.slots[index], kind).min(remaining);
            if fits == 0 {
                continue;
            }
            parts.push(self.take(index, kind, fits));
            remaining -= fits;
        }
        parts
    }

    /// Place every operation of a batch or none of them.
    pub fn place_batch(&mut self, batch: &PlannedBatch) -> Option<PlacedBatch> {
        let mut scratch = self.clone();
        let mut ops = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            let parts = scratch.place(op.kind, op.threads)?;
            ops.push(placed(op, parts));
        }
        *self = scratch;
        Some(PlacedBatch {
            batch: batch.clone(),
            ops,
        })
    }

    /// Best-effort placement of a prep wave. Operations that get no
    /// capacity at all are dropped.
    pub fn place_prep(&mut self, wave: &PrepWave) -> Vec<PlacedOp> {
        wave.ops
            .iter()
            .filter_map(|op| {
                let parts = self.place_up_to(op.kind, op.threads);
                (!parts.is_empty()).then(|| placed(op, parts))
            })
            .collect()
    }
}

fn placed(op: &PlannedOp, parts: Vec<Placement>) -> PlacedOp {
    PlacedOp {
        kind: op.kind,
        launch_delay: op.launch_delay,
        parts,
    }
}

/// Pack batches in planner order. Returns the placed batches and the ones
/// that did not fit this cycle.
pub fn pack_batches(
    pool: &mut CapacityPool,
    batches: Vec<PlannedBatch>,
) -> (Vec<PlacedBatch>, Vec<PlannedBatch>) {
    let mut placed = Vec::new();
    let mut unplaced = Vec::new();
    for batch in batches {
        match pool.place_batch(&batch) {
            Some(p) => {
                trace!(batch_id = batch.id, target_host = %batch.target, "batch placed");
                placed.push(p);
            }
            None => {
                debug!(
                    batch_id = batch.id,
                    target_host = %batch.target,
                    "batch does not fit, dropping"
                );
                unplaced.push(batch);
            }
        }
    }
    (placed, unplaced)
}
