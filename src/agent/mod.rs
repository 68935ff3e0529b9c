//! Coordinator-side handling of the per-segment transfer agents.

pub mod distributor;
pub mod reaper;

pub use distributor::{AgentDistributor, HELPER_NAME};
pub use reaper::{HangingSessionReaper, ReapReport, ReapScope, DEFAULT_DRAIN_GRACE};
