// src/cache/mod.rs

//! Content-addressed result caching.
//!
//! - [`hash`] turns a task into its cache key.
//! - [`result_cache`] stores terminal output, exit code and declared outputs
//!   per hash, crash-safely.
//! - [`outputs`] remembers which hash last produced the outputs currently in
//!   the workspace, so cache replays can skip redundant copies.
//! - [`remote`] is the seam for sharing entries between machines.

pub mod hash;
pub mod outputs;
pub mod remote;
pub mod result_cache;

pub use hash::{Blake3TaskHasher, TaskHasher};
pub use outputs::{FileOutputsStore, MemoryOutputsStore, OutputsCoordinator};
pub use remote::{DirectoryRemoteCache, RemoteCache};
pub use result_cache::{CacheEntry, ResultCache};
