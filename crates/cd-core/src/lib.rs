//! Shared domain types and configuration for the cadence batch engine.

pub mod clock;
pub mod config;
pub mod tag;
pub mod types;
