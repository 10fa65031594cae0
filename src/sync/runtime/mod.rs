//! Imperative shell: async orchestration around the ledger.

pub mod orchestrator;
mod mutations;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use orchestrator::{SyncEngine, TodayFn};
pub use scheduler::RefreshHandle;
