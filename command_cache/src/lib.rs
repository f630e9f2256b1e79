//! Command Cache - Core Library
//!
//! Executes each `(id, command)` pair at most once and serves the stored
//! result to every later request. Concurrent requests for the same pair wait
//! on a single execution; distinct pairs run in parallel.

pub mod batch;
pub mod cli;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod key;
pub mod middleware;
pub mod registry;
pub mod server;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use coordinator::{Coordinator, Resolved};
pub use error::{ResolveError, StoreError};
pub use executor::{Executor, SimulatedExecutor};
pub use key::CommandKey;
pub use store::{FileStore, MemoryStore, Store};
