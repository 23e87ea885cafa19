use async_trait::async_trait;
use cd_core::types::{InvokeRequest, LiveProcess, Node, Pid, ScoredTarget, TargetSnapshot};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClusterError {
    /// The entity could not be read right now. Callers skip it for the cycle.
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The remote side refused an invocation (capacity, duplicate, ...).
    #[error("invocation rejected: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// External surfaces
// ---------------------------------------------------------------------------

/// Node inventory plus the remote invocation surface.
///
/// Invocations are fire-and-forget: `invoke` returns as soon as the remote
/// side accepted (or refused) the process. Completion is only ever observed
/// by polling `live_processes` and `target`.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Usable nodes with their current free capacity.
    async fn nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// Fresh dynamic state of one target.
    async fn target(&self, hostname: &str) -> Result<TargetSnapshot, ClusterError>;

    /// Launch one operation. `Err(ClusterError::Rejected)` when refused.
    async fn invoke(&self, request: &InvokeRequest) -> Result<Pid, ClusterError>;

    /// Operations still running on `node`.
    async fn live_processes(&self, node: &str) -> Result<Vec<LiveProcess>, ClusterError>;

    async fn kill_process(&self, node: &str, pid: Pid) -> Result<(), ClusterError>;
}

/// Periodic scoring of candidate targets, best first.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn score_targets(&self) -> Result<Vec<ScoredTarget>, ClusterError>;
}
