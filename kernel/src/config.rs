// Run Configuration
//
// Everything a compaction run needs to know, loadable from a JSON file.
// Missing fields take their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::filter::FilterConfig;
use crate::log::CommitTs;

/// Default memory budget for one table pass: 2 GiB.
pub const DEFAULT_MEMORY_BUDGET: u64 = 2 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the input log files.
    pub dir: PathBuf,
    /// Directory receiving the compacted streams and the manifest.
    pub output_dir: PathBuf,
    /// Parent of the per-run working directory.
    pub temp_dir: PathBuf,
    pub start_ts: CommitTs,
    /// Last commit ts of the window; 0 means unbounded.
    pub stop_ts: CommitTs,
    /// Bytes of working records a single table pass may hold.
    pub memory_budget: u64,
    /// Tables compacted in parallel.
    pub workers: usize,
    /// Stop scheduling tables after the first failure.
    pub fail_fast: bool,
    /// JSON array of DDL statements replayed before the run.
    pub history_ddl: Option<PathBuf>,
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            temp_dir: std::env::temp_dir(),
            start_ts: 0,
            stop_ts: 0,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            workers: 1,
            fail_fast: true,
            history_ddl: None,
            filter: FilterConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stop_ts != 0 && self.stop_ts < self.start_ts {
            return Err(ConfigError::Invalid(format!(
                "stop_ts {} is before start_ts {}",
                self.stop_ts, self.start_ts
            )));
        }
        if self.memory_budget == 0 {
            return Err(ConfigError::Invalid("memory_budget must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        Ok(())
    }
}
