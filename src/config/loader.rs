// src/config/loader.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::model::{ConfigFile, ConfigSection, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw
/// `RawConfigFile`, task ids in file order.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    parse_str(&contents)
}

/// Parse TOML text into a `RawConfigFile`.
pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    let table: toml::Table = toml::from_str(contents)?;

    let task_order: Vec<String> = table
        .get("task")
        .and_then(toml::Value::as_table)
        .map(|tasks| tasks.keys().cloned().collect())
        .unwrap_or_default();

    let mut raw: RawConfigFile = toml::Value::Table(table).try_into()?;
    raw.task_order = task_order;
    Ok(raw)
}

/// Load a configuration file from path and validate it.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for unknown `after` references, self-dependencies, cycles,
///   unknown executors and basic global config sanity.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    debug!(path = ?path.as_ref(), tasks = config.task.len(), "loaded config");
    Ok(config)
}

/// `Dagrun.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Dagrun.toml")
}

/// Environment variables that override `[config]` booleans.
pub const ENV_OVERRIDES: &[&str] = &[
    "DAGRUN_STREAM_OUTPUT",
    "DAGRUN_PREFIX_OUTPUT",
    "DAGRUN_CACHE_FAILURES",
    "DAGRUN_BATCH_MODE",
    "DAGRUN_SKIP_CACHE",
    "DAGRUN_VERBOSE_LOGGING",
];

/// Apply `DAGRUN_*` overrides from `env` on top of the file values.
///
/// Accepts `true`/`false`/`1`/`0` (case-insensitive); anything else is
/// ignored with a warning.
pub fn apply_env_overrides(section: &mut ConfigSection, env: &BTreeMap<String, String>) {
    for name in ENV_OVERRIDES {
        let Some(raw) = env.get(*name) else {
            continue;
        };
        let Some(value) = parse_bool(raw) else {
            warn!(var = %name, value = %raw, "ignoring non-boolean override");
            continue;
        };

        let slot = match *name {
            "DAGRUN_STREAM_OUTPUT" => &mut section.stream_output,
            "DAGRUN_PREFIX_OUTPUT" => &mut section.prefix_output,
            "DAGRUN_CACHE_FAILURES" => &mut section.cache_failures,
            "DAGRUN_BATCH_MODE" => &mut section.batch_mode,
            "DAGRUN_SKIP_CACHE" => &mut section.skip_cache,
            "DAGRUN_VERBOSE_LOGGING" => &mut section.verbose,
            _ => continue,
        };
        *slot = value;
        debug!(var = %name, value, "applied environment override");
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
