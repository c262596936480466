//! Context enrichment and the short-term replay buffer.
//!
//! Two jobs: keep a bounded record of recent exchanges that survives upstream
//! session rotation (`ShortTermMemory`), and assemble the per-turn
//! `[MEMORY CONTEXT …]` prefix from the dashboard, the agent's inner state,
//! its self-model, and any matching exploration notes (`ContextOptimizer`).
//! Every failure here is soft — an empty context never blocks a turn.

mod context;
mod dashboard;
mod short_term;

pub use context::ContextOptimizer;
pub use dashboard::DashboardClient;
pub use short_term::{Exchange, ShortTermMemory};
