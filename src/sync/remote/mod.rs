pub mod api;
pub mod memory;

pub use api::RemoteStore;
pub use memory::{MemoryStore, Seed, StoreOp};

#[cfg(test)]
mod tests;
