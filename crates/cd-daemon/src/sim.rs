//! An in-memory cluster for tests and the `cadence` binary.
//!
//! Operations take effect on their target when their completion time passes
//! on the injected clock. Capacity is checked on every invocation, and
//! faults (unreadable targets, refused invocations, a dead inventory) can be
//! switched on per test.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ahash::AHashSet;
use async_trait::async_trait;
use cd_core::clock::Clock;
use cd_core::config::OperationsConfig;
use cd_core::types::{
    InvokeRequest, LiveProcess, Node, OperationKind, Pid, ScoredTarget, TargetProfile,
    TargetSnapshot,
};
use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::cluster::{Cluster, ClusterError, TargetRegistry};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct SimNode {
    total: f64,
    used: f64,
}

#[derive(Debug, Clone)]
struct SimTarget {
    snapshot: TargetSnapshot,
    score: f64,
    /// Offered by scoring. Delisted targets stay readable and attackable.
    listed: bool,
}

#[derive(Debug, Clone)]
struct SimProcess {
    process: LiveProcess,
    cost: f64,
    completes_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    targets: BTreeMap<String, SimTarget>,
    processes: Vec<SimProcess>,
    next_pid: Pid,
    unreadable: AHashSet<String>,
    reject_next: usize,
    inventory_down: bool,
    scoring_down: bool,
    invocations: Vec<InvokeRequest>,
    kills: Vec<(String, Pid)>,
}

impl SimState {
    /// Apply every operation that has completed by `now`, in completion order.
    fn settle(&mut self, now: DateTime<Utc>) {
        let (mut done, running): (Vec<SimProcess>, Vec<SimProcess>) =
            std::mem::take(&mut self.processes).into_iter().partition(|p| p.completes_at <= now);
        self.processes = running;
        done.sort_by_key(|p| (p.completes_at, p.process.pid));

        for finished in done {
            if let Some(node) = self.nodes.get_mut(&finished.process.node) {
                node.used = (node.used - finished.cost).max(0.0);
            }
            if let Some(target) = self.targets.get_mut(&finished.process.target) {
                apply_effect(&mut target.snapshot, finished.process.kind, finished.process.threads);
            }
            trace!(
                pid = finished.process.pid,
                kind = %finished.process.kind,
                target_host = %finished.process.target,
                "simulated operation completed"
            );
        }
    }

    fn launch(
        &mut self,
        request: &InvokeRequest,
        cost_per_thread: f64,
        now: DateTime<Utc>,
    ) -> Result<Pid, ClusterError> {
        let Some(target) = self.targets.get(&request.target) else {
            return Err(ClusterError::NotFound(format!("target {}", request.target)));
        };
        let duration = target.snapshot.duration(request.kind);
        let Some(node) = self.nodes.get_mut(&request.node) else {
            return Err(ClusterError::NotFound(format!("node {}", request.node)));
        };
        let cost = request.threads as f64 * cost_per_thread;
        if node.used + cost > node.total + EPSILON {
            return Err(ClusterError::Rejected(format!(
                "{} needs {cost} capacity, {} free",
                request.node,
                node.total - node.used
            )));
        }
        node.used += cost;

        self.next_pid += 1;
        let pid = self.next_pid;
        let launch_delay = Duration::milliseconds(request.launch_delay_ms as i64);
        let completes_at = request.dispatched_at + launch_delay + duration;
        self.processes.push(SimProcess {
            process: LiveProcess {
                pid,
                node: request.node.clone(),
                kind: request.kind,
                target: request.target.clone(),
                launch_delay_ms: request.launch_delay_ms,
                dispatched_at: request.dispatched_at,
                tag: request.tag.clone(),
                threads: request.threads,
            },
            cost,
            completes_at: completes_at.max(now),
        });
        Ok(pid)
    }
}

fn apply_effect(snapshot: &mut TargetSnapshot, kind: OperationKind, threads: u32) {
    let p = snapshot.profile.clone();
    let t = threads as f64;
    match kind {
        OperationKind::Extract => {
            let taken = (t * p.extract_fraction_per_thread).min(1.0);
            snapshot.current_yield *= 1.0 - taken;
            snapshot.current_defense += t * p.extract_defense_per_thread;
        }
        OperationKind::Counteract => {
            snapshot.current_defense =
                (snapshot.current_defense - t * p.counteract_per_thread).max(snapshot.min_defense);
        }
        OperationKind::Restore => {
            let grown = snapshot.current_yield.max(1.0) * p.restore_growth_per_thread.powf(t);
            snapshot.current_yield = grown.min(snapshot.max_yield);
            snapshot.current_defense += t * p.restore_defense_per_thread;
        }
    }
}

/// Simulated node inventory, targets and worker processes.
pub struct SimCluster {
    clock: Arc<dyn Clock>,
    costs: OperationsConfig,
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new(clock: Arc<dyn Clock>, costs: OperationsConfig) -> Self {
        Self {
            clock,
            costs,
            state: Mutex::new(SimState::default()),
        }
    }

    /// A small heterogeneous fleet with a handful of targets at varying
    /// distances from baseline.
    pub fn demo(clock: Arc<dyn Clock>, costs: OperationsConfig, primary_node: &str) -> Self {
        let sim = Self::new(clock, costs);
        sim.add_node(primary_node, 512.0);
        for (i, capacity) in [256.0, 128.0, 128.0, 64.0, 32.0, 16.0, 8.0].iter().enumerate() {
            sim.add_node(&format!("node-{:02}", i + 1), *capacity);
        }
        let targets = [
            ("orchid", 4_000_000.0, 4_000_000.0, 12.0, 12.0, 0.92),
            ("juniper", 1_500_000.0, 2_500_000.0, 18.0, 8.0, 0.81),
            ("basalt", 800_000.0, 900_000.0, 5.0, 5.0, 0.55),
            ("quartz", 50_000.0, 6_000_000.0, 40.0, 15.0, 0.37),
        ];
        for (host, current_yield, max_yield, defense, min_defense, score) in targets {
            sim.add_target(
                TargetSnapshot {
                    hostname: host.into(),
                    current_yield,
                    max_yield,
                    current_defense: defense,
                    min_defense,
                    profile: TargetProfile::default(),
                },
                score,
            );
        }
        sim
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("SimCluster lock poisoned")
    }

    fn settled(&self) -> std::sync::MutexGuard<'_, SimState> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.settle(now);
        state
    }

    pub fn add_node(&self, hostname: &str, capacity: f64) {
        self.lock().nodes.insert(
            hostname.to_string(),
            SimNode {
                total: capacity,
                used: 0.0,
            },
        );
    }

    pub fn add_target(&self, snapshot: TargetSnapshot, score: f64) {
        self.lock()
            .targets
            .insert(snapshot.hostname.clone(), SimTarget { snapshot, score, listed: true });
    }

    /// Drop a target from scoring without touching its state or live work.
    pub fn delist_target(&self, hostname: &str) {
        if let Some(target) = self.lock().targets.get_mut(hostname) {
            target.listed = false;
        }
    }

    /// Overwrite a target's dynamic state, keeping its score.
    pub fn set_target_state(&self, hostname: &str, current_yield: f64, current_defense: f64) {
        if let Some(target) = self.lock().targets.get_mut(hostname) {
            target.snapshot.current_yield = current_yield;
            target.snapshot.current_defense = current_defense;
        }
    }

    /// Current state of a target after settling, ignoring read faults.
    pub fn peek_target(&self, hostname: &str) -> Option<TargetSnapshot> {
        self.settled().targets.get(hostname).map(|t| t.snapshot.clone())
    }

    pub fn fail_target_reads(&self, hostname: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.unreadable.insert(hostname.to_string());
        } else {
            state.unreadable.remove(hostname);
        }
    }

    /// Refuse the next `count` invocations regardless of capacity.
    pub fn reject_next_invocations(&self, count: usize) {
        self.lock().reject_next = count;
    }

    pub fn fail_inventory(&self, failing: bool) {
        self.lock().inventory_down = failing;
    }

    pub fn fail_scoring(&self, failing: bool) {
        self.lock().scoring_down = failing;
    }

    /// Start a process directly, as if launched by an earlier run.
    pub fn spawn_process(&self, request: &InvokeRequest) -> Result<Pid, ClusterError> {
        let now = self.clock.now();
        let cost = self.costs.cost(request.kind);
        self.lock().launch(request, cost, now)
    }

    /// Every invocation accepted or refused so far, in order.
    pub fn invocations(&self) -> Vec<InvokeRequest> {
        self.lock().invocations.clone()
    }

    pub fn kills(&self) -> Vec<(String, Pid)> {
        self.lock().kills.clone()
    }

    /// Processes still running after settling.
    pub fn running(&self) -> Vec<LiveProcess> {
        self.settled()
            .processes
            .iter()
            .map(|p| p.process.clone())
            .collect()
    }

    pub fn free_capacity(&self, hostname: &str) -> Option<f64> {
        self.settled()
            .nodes
            .get(hostname)
            .map(|n| n.total - n.used)
    }
}

#[async_trait]
impl Cluster for SimCluster {
    async fn nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let state = self.settled();
        if state.inventory_down {
            return Err(ClusterError::Unreachable("node inventory".into()));
        }
        Ok(state
            .nodes
            .iter()
            .map(|(host, n)| Node::new(host.clone(), n.total, (n.total - n.used).max(0.0)))
            .collect())
    }

    async fn target(&self, hostname: &str) -> Result<TargetSnapshot, ClusterError> {
        let state = self.settled();
        if state.unreadable.contains(hostname) {
            return Err(ClusterError::Unreachable(format!("target {hostname}")));
        }
        state
            .targets
            .get(hostname)
            .map(|t| t.snapshot.clone())
            .ok_or_else(|| ClusterError::NotFound(format!("target {hostname}")))
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<Pid, ClusterError> {
        let now = self.clock.now();
        let cost = self.costs.cost(request.kind);
        let mut state = self.settled();
        state.invocations.push(request.clone());
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Err(ClusterError::Rejected("injected rejection".into()));
        }
        state.launch(request, cost, now)
    }

    async fn live_processes(&self, node: &str) -> Result<Vec<LiveProcess>, ClusterError> {
        let state = self.settled();
        if !state.nodes.contains_key(node) {
            return Err(ClusterError::NotFound(format!("node {node}")));
        }
        Ok(state
            .processes
            .iter()
            .filter(|p| p.process.node == node)
            .map(|p| p.process.clone())
            .collect())
    }

    async fn kill_process(&self, node: &str, pid: Pid) -> Result<(), ClusterError> {
        let mut state = self.settled();
        let Some(index) = state
            .processes
            .iter()
            .position(|p| p.process.pid == pid && p.process.node == node)
        else {
            return Err(ClusterError::NotFound(format!("pid {pid} on {node}")));
        };
        let killed = state.processes.remove(index);
        if let Some(n) = state.nodes.get_mut(node) {
            n.used = (n.used - killed.cost).max(0.0);
        }
        state.kills.push((node.to_string(), pid));
        Ok(())
    }
}

#[async_trait]
impl TargetRegistry for SimCluster {
    async fn score_targets(&self) -> Result<Vec<ScoredTarget>, ClusterError> {
        let state = self.lock();
        if state.scoring_down {
            return Err(ClusterError::Unreachable("target registry".into()));
        }
        let mut scored: Vec<ScoredTarget> = state
            .targets
            .values()
            .filter(|t| t.listed)
            .map(|t| ScoredTarget::new(t.snapshot.hostname.clone(), t.score))
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}
