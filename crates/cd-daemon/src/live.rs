//! A per-cycle view of every operation still running in the fleet.
//!
//! The cluster holds the only durable record of in-flight work, so this
//! scan is what reconstruction, prep gating and desync cleanup all read.

use std::collections::BTreeMap;

use cd_core::tag::OperationTag;
use cd_core::types::{BatchId, LiveProcess, Node};
use tracing::{debug, warn};

use crate::cluster::Cluster;

#[derive(Debug, Clone, Default)]
pub struct LiveIndex {
    processes: Vec<(Option<OperationTag>, LiveProcess)>,
}

impl LiveIndex {
    /// List live processes on every node. A node that cannot be listed is
    /// skipped for this cycle.
    pub async fn scan(cluster: &dyn Cluster, nodes: &[Node]) -> Self {
        let mut processes = Vec::new();
        for node in nodes {
            match cluster.live_processes(&node.hostname).await {
                Ok(list) => processes.extend(list),
                Err(e) => {
                    warn!(
                        node = %node.hostname,
                        error = %e,
                        "live process listing failed, skipping node"
                    );
                }
            }
        }
        debug!(processes = processes.len(), "live scan complete");
        Self::from_processes(processes)
    }

    pub fn from_processes(processes: Vec<LiveProcess>) -> Self {
        Self {
            processes: processes
                .into_iter()
                .map(|p| (p.tag.parse::<OperationTag>().ok(), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Whether any process of batch `id` is still running.
    pub fn has_batch(&self, id: BatchId) -> bool {
        self.processes
            .iter()
            .any(|(t, _)| t.and_then(|t| t.batch_id()) == Some(id))
    }

    /// Everything running against `target`, whoever launched it.
    pub fn for_target<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a LiveProcess> + 'a {
        self.processes
            .iter()
            .filter(move |(_, p)| p.target == target)
            .map(|(_, p)| p)
    }

    /// Whether any process against `target` carries `tag`.
    pub fn has_tagged(&self, target: &str, tag: OperationTag) -> bool {
        self.processes
            .iter()
            .any(|(t, p)| p.target == target && *t == Some(tag))
    }

    /// Batch-tagged processes grouped by batch id.
    pub fn batch_groups(&self) -> BTreeMap<BatchId, Vec<&LiveProcess>> {
        let mut groups: BTreeMap<BatchId, Vec<&LiveProcess>> = BTreeMap::new();
        for (tag, process) in &self.processes {
            if let Some(id) = tag.and_then(|t| t.batch_id()) {
                groups.entry(id).or_default().push(process);
            }
        }
        groups
    }

    pub fn max_batch_id(&self) -> Option<BatchId> {
        self.processes
            .iter()
            .filter_map(|(tag, _)| tag.and_then(|t| t.batch_id()))
            .max()
    }
}
