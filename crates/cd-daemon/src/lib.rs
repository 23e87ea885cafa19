//! Batch scheduling and fleet-allocation engine for cadence daemons.
//!
//! The daemon runs one cooperative loop that, every cycle:
//! - partitions fleet capacity between batching and the share workload
//! - reconciles landed batches and recovers desynced targets
//! - plans timed four-operation batches and prep waves per target
//! - bin-packs them into free node capacity and dispatches them
//! - publishes a status snapshot and sleeps until the next completion

pub mod allocator;
pub mod bus;
pub mod cluster;
pub mod daemon;
pub mod desync;
pub mod dispatcher;
pub mod engine;
pub mod income;
pub mod live;
pub mod modes;
pub mod planner;
pub mod shutdown;
pub mod sim;
pub mod targets;
pub mod tracker;
