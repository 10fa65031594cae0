pub mod config;
pub mod error;
pub mod model;
pub mod sync;

pub use config::SyncConfig;
pub use error::{RemoteError, SyncError, SyncResult};
pub use sync::{HabitState, MemoryStore, RemoteStore, Seed, SyncEngine};
