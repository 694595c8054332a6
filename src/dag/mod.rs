// src/dag/mod.rs

//! Task graph representation and scheduling.
//!
//! - [`task`] holds tasks and the directed acyclic task graph.
//! - [`schedule`] decides which tasks (or batches of tasks) are ready.

pub mod schedule;
pub mod task;

pub use schedule::{Batch, HashRequest, TaskSchedule};
pub use task::{Task, TaskGraph, TaskId, TaskTarget};
