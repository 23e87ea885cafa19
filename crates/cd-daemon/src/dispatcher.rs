use cd_core::tag::OperationTag;
use cd_core::types::InvokeRequest;
use cd_telemetry::metrics::{global_metrics, OPS_DISPATCHED, OPS_REJECTED};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::allocator::{PlacedBatch, PlacedOp};
use crate::cluster::Cluster;
use crate::tracker::TrackedOp;

/// Turns placed operations into tagged remote invocations.
///
/// Invocations are fire-and-forget. Nothing rejected is retried within the
/// cycle; the planner will try again next time round.
pub struct Dispatcher<'a> {
    cluster: &'a dyn Cluster,
    now: DateTime<Utc>,
    dispatched: usize,
    rejected: usize,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cluster: &'a dyn Cluster, now: DateTime<Utc>) -> Self {
        Self {
            cluster,
            now,
            dispatched: 0,
            rejected: 0,
        }
    }

    /// Invocations accepted so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Invocations refused so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Launch every part of every operation. Returns the parts that were
    /// accepted and whether any part was refused.
    pub async fn dispatch_ops(
        &mut self,
        target: &str,
        tag: OperationTag,
        ops: &[PlacedOp],
    ) -> (Vec<TrackedOp>, bool) {
        let tag_text = tag.to_string();
        let mut launched = Vec::new();
        let mut any_rejected = false;

        for op in ops {
            let launch_delay_ms = op.launch_delay.num_milliseconds().max(0) as u64;
            for part in &op.parts {
                let request = InvokeRequest {
                    kind: op.kind,
                    node: part.node.clone(),
                    threads: part.threads,
                    target: target.to_string(),
                    launch_delay_ms,
                    dispatched_at: self.now,
                    tag: tag_text.clone(),
                };
                match self.cluster.invoke(&request).await {
                    Ok(pid) => {
                        self.dispatched += 1;
                        global_metrics()
                            .increment_counter(OPS_DISPATCHED, &[("kind", op.kind.as_str())]);
                        launched.push(TrackedOp {
                            kind: op.kind,
                            node: part.node.clone(),
                            pid,
                            threads: part.threads,
                        });
                    }
                    Err(e) => {
                        self.rejected += 1;
                        any_rejected = true;
                        global_metrics()
                            .increment_counter(OPS_REJECTED, &[("kind", op.kind.as_str())]);
                        warn!(
                            target_host = %target,
                            node = %part.node,
                            kind = %op.kind,
                            threads = part.threads,
                            tag = %tag_text,
                            error = %e,
                            "invocation rejected"
                        );
                    }
                }
            }
        }

        (launched, any_rejected)
    }

    /// Launch a whole batch. If any part is refused, the parts that did
    /// launch are killed and `None` is returned.
    pub async fn dispatch_batch(&mut self, placed: &PlacedBatch) -> Option<Vec<TrackedOp>> {
        let batch = &placed.batch;
        let (launched, any_rejected) = self
            .dispatch_ops(&batch.target, batch.tag(), &placed.ops)
            .await;
        if !any_rejected {
            debug!(
                batch_id = batch.id,
                target_host = %batch.target,
                processes = launched.len(),
                "batch dispatched"
            );
            return Some(launched);
        }

        warn!(
            batch_id = batch.id,
            target_host = %batch.target,
            launched = launched.len(),
            "batch partially rejected, killing launched parts"
        );
        for op in &launched {
            if let Err(e) = self.cluster.kill_process(&op.node, op.pid).await {
                warn!(
                    node = %op.node,
                    pid = op.pid,
                    error = %e,
                    "failed to kill partial batch process"
                );
            }
        }
        None
    }
}
