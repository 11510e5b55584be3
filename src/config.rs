//! Configuration Contract: the frozen shape the core consumes, plus the
//! on-disk loader that produces it.
//!
//! The loader is an external collaborator in spirit — `Scheduler::new`
//! never reads a file, only a [`Config`] value — but ships here so the
//! `schedulerd` binary is actually runnable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{validate_name, ConcurrencyGroup, Job};

/// Descriptor for the selected Store back-end. Only `type = "sqlite"` is
/// implemented; the shape stays generic so a future back-end only adds a
/// match arm and new fields here, not a new configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    #[serde(rename = "type", default = "default_db_type")]
    pub kind: String,
    /// Only meaningful for `type = "sqlite"`; defaults to `<data_dir>/schedulerd.db`.
    pub path: Option<PathBuf>,
}

fn default_db_type() -> String {
    "sqlite".to_string()
}

impl Default for DatabaseDescriptor {
    fn default() -> Self {
        DatabaseDescriptor {
            kind: default_db_type(),
            path: None,
        }
    }
}

/// The frozen configuration shape the Scheduler Loop is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub jobs: HashMap<String, Job>,
    #[serde(default)]
    pub concurrency_groups: HashMap<String, ConcurrencyGroup>,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub shutdown_kill_runs: bool,
    #[serde(default, with = "humantime_serde::option")]
    pub shutdown_kill_grace: Option<Duration>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub database: DatabaseDescriptor,
}

impl Config {
    /// Load and validate a configuration file. Format (YAML or JSON) is
    /// inferred from the extension; `.yaml`/`.yml` require the `yaml`
    /// feature.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let raw: Config = if is_yaml {
            #[cfg(feature = "yaml")]
            {
                serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            #[cfg(not(feature = "yaml"))]
            {
                return Err(ConfigError::Parse(
                    "YAML configuration requires the `yaml` feature".to_string(),
                ));
            }
        } else {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        raw.validate()?;
        Ok(raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, job) in &self.jobs {
            if key != &job.name {
                return Err(ConfigError::Invalid(format!(
                    "job map key {:?} does not match job.name {:?}",
                    key, job.name
                )));
            }
            validate_name(&job.name).map_err(ConfigError::Invalid)?;
            for group in &job.concurrency_groups {
                if !self.concurrency_groups.contains_key(group) {
                    return Err(ConfigError::UnknownGroup {
                        job: job.name.clone(),
                        group: group.clone(),
                    });
                }
            }
        }
        for (key, group) in &self.concurrency_groups {
            if key != &group.name {
                return Err(ConfigError::Invalid(format!(
                    "group map key {:?} does not match group.name {:?}",
                    key, group.name
                )));
            }
            validate_name(&group.name).map_err(ConfigError::Invalid)?;
            if group.max == 0 {
                return Err(ConfigError::Invalid(format!(
                    "group {:?} must have max >= 1",
                    group.name
                )));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("schedulerd.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str, ext: &str) -> tempfile::TempPath {
        let mut f = tempfile::Builder::new().suffix(ext).tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.into_temp_path()
    }

    #[test]
    fn loads_minimal_json_config() {
        let json = r#"{
            "jobs": {"build": {"name": "build", "command": ["echo", "hi"]}},
            "data_dir": "/tmp/schedulerd-test"
        }"#;
        let path = write_tmp(json, ".json");
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.jobs.len(), 1);
        assert_eq!(cfg.database.kind, "sqlite");
    }

    #[test]
    fn rejects_job_referencing_unknown_group() {
        let json = r#"{
            "jobs": {"build": {"name": "build", "command": ["echo"], "concurrency_groups": ["nope"]}},
            "data_dir": "/tmp/schedulerd-test"
        }"#;
        let path = write_tmp(json, ".json");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_mismatched_map_key_and_name() {
        let json = r#"{
            "jobs": {"wrong-key": {"name": "build", "command": ["echo"]}},
            "data_dir": "/tmp/schedulerd-test"
        }"#;
        let path = write_tmp(json, ".json");
        assert!(Config::load(&path).is_err());
    }
}
