//! Process-level configuration for the connectivity layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the worker pool size.
pub const WORKER_THREADS_ENV_VAR: &str = "WORKBENCH_WORKER_THREADS";

/// Default number of worker threads running engine calls.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Runtime settings shared by every connection in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Threads in the worker pool that runs blocking engine calls.
    pub worker_threads: usize,
    /// Optional tracing filter handed to [`crate::logging::LogConfig`].
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: DEFAULT_WORKER_THREADS, log_filter: None }
    }
}

impl RuntimeConfig {
    /// Build from `WORKBENCH_WORKER_THREADS` and `WORKBENCH_LOG`, falling back to defaults.
    pub fn from_env() -> Self {
        let worker_threads = std::env::var(WORKER_THREADS_ENV_VAR)
            .ok()
            .and_then(|value| parse_worker_threads(&value))
            .unwrap_or(DEFAULT_WORKER_THREADS);
        let log_filter = std::env::var(crate::logging::LOG_ENV_VAR).ok().filter(|f| !f.is_empty());

        Self { worker_threads, log_filter }
    }

    /// Set the worker pool size. Zero is clamped to one.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }
}

fn parse_worker_threads(value: &str) -> Option<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            tracing::warn!(value, "Ignoring invalid {WORKER_THREADS_ENV_VAR}");
            None
        }
        Ok(n) => Some(n),
    }
}

/// Get the default data directory based on OS and build type.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./workbench_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("workbench"))
            .unwrap_or_else(|| PathBuf::from("./workbench_data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_uses_two_workers() {
        let config = RuntimeConfig::default();
        assert_eq!(config.worker_threads, 2);
        assert!(config.log_filter.is_none());
    }

    #[test]
    fn worker_thread_parsing_rejects_zero_and_garbage() {
        assert_eq!(parse_worker_threads("4"), Some(4));
        assert_eq!(parse_worker_threads(" 3 "), Some(3));
        assert_eq!(parse_worker_threads("0"), None);
        assert_eq!(parse_worker_threads("many"), None);
    }

    #[test]
    fn with_worker_threads_clamps_to_one() {
        assert_eq!(RuntimeConfig::default().with_worker_threads(0).worker_threads, 1);
    }
}
