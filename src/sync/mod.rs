pub mod cache;
pub mod ledger;
pub mod remote;
pub mod requests;
pub mod retry;
pub mod runtime;
pub mod throttle;
pub mod version;

pub use ledger::{ActionKind, HabitState, OptimisticLedger};
pub use remote::{MemoryStore, RemoteStore, Seed, StoreOp};
pub use runtime::{RefreshHandle, SyncEngine, TodayFn};
