use std::fmt;
use std::str::FromStr;

use crate::types::BatchId;

/// Correlation tag attached to every remote invocation.
///
/// The live process list is the only record of what is running, so the tag
/// has to carry enough to rebuild engine state after a restart: batch tags
/// embed the batch id, everything else only names the workload that
/// launched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationTag {
    Batch(BatchId),
    Prep,
    Legacy,
    Throughput,
    Drain,
}

impl OperationTag {
    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            OperationTag::Batch(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_prep(&self) -> bool {
        matches!(self, OperationTag::Prep)
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTag::Batch(id) => write!(f, "batch:{id}"),
            OperationTag::Prep => f.write_str("prep"),
            OperationTag::Legacy => f.write_str("legacy"),
            OperationTag::Throughput => f.write_str("throughput"),
            OperationTag::Drain => f.write_str("drain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised operation tag: {0:?}")]
pub struct TagParseError(pub String);

impl FromStr for OperationTag {
    type Err = TagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prep" => Ok(OperationTag::Prep),
            "legacy" => Ok(OperationTag::Legacy),
            "throughput" => Ok(OperationTag::Throughput),
            "drain" => Ok(OperationTag::Drain),
            other => other
                .strip_prefix("batch:")
                .and_then(|id| id.parse::<BatchId>().ok())
                .map(OperationTag::Batch)
                .ok_or_else(|| TagParseError(other.to_string())),
        }
    }
}
