// SPDX-License-Identifier: MIT

//! Settings loader - YAML file plus environment overrides

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::pipeline::PipelineConfig;
use crate::flow::executor::EngineConfig;
use crate::flow::state::StateSchema;

pub const ENV_JOIN_TIMEOUT_SECS: &str = "KINETIC_JOIN_TIMEOUT_SECS";
pub const ENV_MAX_PARALLEL_BRANCHES: &str = "KINETIC_MAX_PARALLEL_BRANCHES";
pub const ENV_MAX_TRANSITIONS: &str = "KINETIC_MAX_TRANSITIONS";
pub const ENV_MAX_RESEARCH_LOOPS: &str = "KINETIC_MAX_RESEARCH_LOOPS";
pub const ENV_CHECKPOINT_DIR: &str = "KINETIC_CHECKPOINT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

/// Engine limits as written in the settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds to wait on a fan-out batch; unset waits forever
    pub join_timeout_secs: Option<u64>,
    pub max_parallel_branches: Option<usize>,
    pub max_transitions: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            join_timeout_secs: defaults.join_timeout.map(|d| d.as_secs()),
            max_parallel_branches: defaults.max_parallel_branches,
            max_transitions: defaults.max_transitions,
        }
    }
}

/// Resolved settings of the content pipeline service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub pipeline: PipelineConfig,
    pub checkpoint_dir: PathBuf,
    /// Extra state fields and their merge policies
    pub state: StateSchema,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            pipeline: PipelineConfig::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            state: StateSchema::default(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_yaml(&content)
    }

    /// Parse settings from a YAML string; an empty document yields the defaults
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `KINETIC_*` overrides from the process environment
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parse_env::<u64>(&lookup, ENV_JOIN_TIMEOUT_SECS)? {
            // 0 disables the timeout
            self.engine.join_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(n) = parse_env::<usize>(&lookup, ENV_MAX_PARALLEL_BRANCHES)? {
            self.engine.max_parallel_branches = (n > 0).then_some(n);
        }
        if let Some(n) = parse_env(&lookup, ENV_MAX_TRANSITIONS)? {
            self.engine.max_transitions = n;
        }
        if let Some(n) = parse_env(&lookup, ENV_MAX_RESEARCH_LOOPS)? {
            self.pipeline.max_research_loops = n;
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR).filter(|d| !d.is_empty()) {
            self.checkpoint_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            join_timeout: self.engine.join_timeout_secs.map(Duration::from_secs),
            max_parallel_branches: self.engine.max_parallel_branches,
            max_transitions: self.engine.max_transitions,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::state::ReducerType;
    use std::collections::HashMap;

    #[test]
    fn test_parse_settings() {
        let yaml = r#"
engine:
  join_timeout_secs: 30
  max_parallel_branches: 4
pipeline:
  max_research_loops: 5
checkpoint_dir: /var/lib/kinetic
state:
  notes:
    type: array
    reducer: append
"#;
        let settings = Settings::parse_yaml(yaml).unwrap();
        assert_eq!(settings.engine.join_timeout_secs, Some(30));
        assert_eq!(settings.engine.max_transitions, 1000);
        assert_eq!(settings.pipeline.max_research_loops, 5);
        assert_eq!(settings.pipeline.initial_queries, 3);
        assert_eq!(settings.checkpoint_dir, PathBuf::from("/var/lib/kinetic"));
        assert_eq!(settings.state.reducer("notes"), ReducerType::Append);

        let engine = settings.engine_config();
        assert_eq!(engine.join_timeout, Some(Duration::from_secs(30)));
        assert_eq!(engine.max_parallel_branches, Some(4));
    }

    #[test]
    fn test_load_bundled_settings() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/kinetic.yaml");
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.engine.max_parallel_branches, Some(8));
        assert_eq!(settings.state.reducer("review_notes"), ReducerType::Append);

        let err = Settings::load(path.with_file_name("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Settings::parse_yaml("").unwrap(), Settings::default());
        assert_eq!(Settings::default().engine_config().join_timeout, None);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_JOIN_TIMEOUT_SECS, "0"),
            (ENV_MAX_TRANSITIONS, "50"),
            (ENV_MAX_RESEARCH_LOOPS, "1"),
            (ENV_CHECKPOINT_DIR, "/tmp/runs"),
        ]);
        let base = Settings::parse_yaml("engine:\n  join_timeout_secs: 10\n").unwrap();
        let settings = base
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.engine.join_timeout_secs, None);
        assert_eq!(settings.engine.max_transitions, 50);
        assert_eq!(settings.pipeline.max_research_loops, 1);
        assert_eq!(settings.checkpoint_dir, PathBuf::from("/tmp/runs"));
    }

    #[test]
    fn test_invalid_env_value() {
        let err = Settings::default()
            .with_overrides(|k| (k == ENV_MAX_TRANSITIONS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == ENV_MAX_TRANSITIONS)
        );
    }
}
