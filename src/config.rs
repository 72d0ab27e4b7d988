//=====================================================
// File: config.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Pipeline configuration
// Objective: Load optimizer, VM and collector settings from `strata.toml`,
//            falling back to defaults for anything not written
//=====================================================

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// File looked up next to a source file when no explicit path is given.
pub const CONFIG_FILE: &str = "strata.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading configuration from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("serializing configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level configuration model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub optimizer: OptimizerConfig,
    pub vm: VmConfig,
    pub gc: GcConfig,
}

/// Pass toggles and limits for both optimizers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub fold: bool,
    pub dce: bool,
    pub inline: bool,
    pub loops: bool,
    pub cse: bool,
    /// Largest literal trip count that is fully unrolled.
    pub unroll_limit: usize,
    pub inline_max_params: usize,
    pub inline_max_statements: usize,
    pub peephole: bool,
    pub register_allocation: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            fold: true,
            dce: true,
            inline: true,
            loops: true,
            cse: true,
            unroll_limit: 4,
            inline_max_params: 3,
            inline_max_statements: 5,
            peephole: true,
            register_allocation: true,
        }
    }
}

impl OptimizerConfig {
    /// Every pass switched off; what `--no-opt` runs with.
    pub fn disabled() -> Self {
        Self {
            fold: false,
            dce: false,
            inline: false,
            loops: false,
            cse: false,
            peephole: false,
            register_allocation: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions executed before the run is aborted. `None` is unlimited.
    pub step_limit: Option<u64>,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            step_limit: None,
            max_call_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Outstanding bytes (`allocated - freed`) that trigger a cycle.
    pub threshold_bytes: usize,
    pub background: bool,
    pub poll_interval_ms: u64,
    pub compact: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024 * 1024,
            background: true,
            poll_interval_ms: 5,
            compact: true,
        }
    }
}

impl StrataConfig {
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads an explicit configuration file. A missing file is an error here.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text, path)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Loads `strata.toml` from the directory holding `source`, or defaults
    /// when there is none.
    pub fn discover(source: &Path) -> Result<Self, ConfigError> {
        let dir = source.parent().unwrap_or_else(|| Path::new("."));
        let candidate = dir.join(CONFIG_FILE);
        if !candidate.exists() {
            debug!(dir = %dir.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&candidate)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_keep_defaults() {
        let config = StrataConfig::from_toml_str(
            "[optimizer]\ncse = false\n[gc]\nbackground = false\n",
            Path::new("inline.toml"),
        )
        .expect("parse");
        assert!(!config.optimizer.cse);
        assert!(config.optimizer.fold);
        assert_eq!(config.optimizer.unroll_limit, 4);
        assert!(!config.gc.background);
        assert_eq!(config.vm.max_call_depth, 1024);
    }

    #[test]
    fn discover_without_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StrataConfig::discover(&dir.path().join("main.st")).expect("discover");
        assert_eq!(config, StrataConfig::default());
    }

    #[test]
    fn saved_configuration_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        let mut config = StrataConfig::default();
        config.vm.step_limit = Some(500);
        config.optimizer.inline = false;
        config.save(&path).expect("save");
        let loaded = StrataConfig::discover(&dir.path().join("main.st")).expect("discover");
        assert_eq!(loaded, config);
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let error = StrataConfig::from_toml_str("[vm\n", Path::new("bad.toml"))
            .expect_err("malformed toml");
        assert!(error.to_string().contains("bad.toml"));
    }
}
