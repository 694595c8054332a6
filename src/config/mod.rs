// src/config/mod.rs

//! Configuration loading and validation for dagrun.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk and apply environment overrides
//!   (`loader.rs`).
//! - Validate references, executors and acyclicity (`validate.rs`).
//! - Resolve the validated config into a task graph, an executor registry
//!   and run options (`resolve.rs`).

pub mod loader;
pub mod model;
pub mod resolve;
pub mod validate;

pub use loader::{apply_env_overrides, default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{ConfigFile, ConfigSection, ExecutorConfig, RawConfigFile, TaskConfig};
pub use validate::validate_config;
