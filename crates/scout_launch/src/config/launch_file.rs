//! Launch file YAML schema definitions

use crate::config::params::ParameterSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Root launch file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchFile {
    /// Launch file format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Session parameter defaults, merged into every unit at start time
    #[serde(default)]
    pub params: ParameterSet,

    /// Environment variables applied to all units
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Unit definitions (ordered map; the order is the registration order)
    pub units: IndexMap<String, UnitConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Configuration for one launchable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Bare OS process or managed service node
    #[serde(default)]
    pub kind: UnitKind,

    /// Executable path or name resolved via PATH
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Per-unit parameter overrides
    #[serde(default)]
    pub params: ParameterSet,

    /// Environment variables specific to this unit
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Units that must be running before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Startup delay in milliseconds after dependencies are ready
    #[serde(default)]
    pub startup_delay_ms: Option<u64>,

    /// Bare process that is expected to finish on its own with status zero
    #[serde(default)]
    pub run_to_completion: bool,

    /// Readiness detection for managed nodes
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,

    /// What to do when this unit fails
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// Kind of launchable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Bare OS process, considered running as soon as it spawns
    Process,
    /// Managed service node with observable readiness
    #[default]
    Node,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Process => f.write_str("process"),
            UnitKind::Node => f.write_str("node"),
        }
    }
}

/// How a managed node signals that it has finished initializing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Regex matched against the node's stdout
    pub pattern: String,
    /// Deadline in milliseconds for the readiness signal
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Failure policy for one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole session and shut everything down (default)
    #[default]
    FailFast,
    /// Re-attempt the start up to the given number of times with bounded
    /// backoff, then fail fast
    RestartLimited(u32),
    /// Log the failure and keep the session going. Units that depend on the
    /// failed one stay pending forever.
    Ignore,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => f.write_str("fail fast"),
            FailurePolicy::RestartLimited(n) => write!(f, "restart up to {n} times"),
            FailurePolicy::Ignore => f.write_str("ignore"),
        }
    }
}

impl LaunchFile {
    /// Load a launch file from a YAML file on disk
    pub fn from_file(path: &str) -> Result<Self, LaunchFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| LaunchFileError::Io {
            path: path.to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a launch file from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, LaunchFileError> {
        let launch_file: LaunchFile =
            serde_yaml::from_str(content).map_err(LaunchFileError::Parse)?;
        launch_file.validate()?;
        Ok(launch_file)
    }

    /// Validate schema-level constraints. Dependency resolution (unknown
    /// names, cycles) is the resolver's job and is not duplicated here.
    pub fn validate(&self) -> Result<(), LaunchFileError> {
        for (name, unit) in &self.units {
            if unit.command.trim().is_empty() {
                return Err(LaunchFileError::Validation(format!(
                    "Unit '{name}': 'command' must not be empty"
                )));
            }

            if unit.run_to_completion && unit.kind != UnitKind::Process {
                return Err(LaunchFileError::Validation(format!(
                    "Unit '{name}': 'run_to_completion' only applies to kind 'process'"
                )));
            }

            if let Some(readiness) = &unit.readiness {
                if unit.kind != UnitKind::Node {
                    return Err(LaunchFileError::Validation(format!(
                        "Unit '{name}': 'readiness' only applies to kind 'node'"
                    )));
                }
                if let Err(e) = regex::Regex::new(&readiness.pattern) {
                    return Err(LaunchFileError::Validation(format!(
                        "Unit '{name}': invalid readiness pattern: {e}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Errors that can occur when loading a launch file
#[derive(Debug, thiserror::Error)]
pub enum LaunchFileError {
    #[error("Failed to read launch file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse launch file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::params::ParamValue;

    #[test]
    fn test_parse_simple_launch_file() {
        let yaml = r#"
version: "1.0"
params:
  use_sim_time: true
units:
  simulator:
    kind: process
    command: gazebo
    args: ["--verbose"]
  slam:
    command: async_slam_node
    depends_on:
      - simulator
"#;
        let launch_file = LaunchFile::from_yaml(yaml).unwrap();
        assert_eq!(launch_file.units.len(), 2);
        assert_eq!(launch_file.units["simulator"].kind, UnitKind::Process);
        assert_eq!(launch_file.units["slam"].kind, UnitKind::Node);
        assert_eq!(
            launch_file.params.get("use_sim_time"),
            Some(&ParamValue::Bool(true))
        );
    }

    #[test]
    fn test_default_failure_policy_is_fail_fast() {
        let yaml = r#"
units:
  simulator:
    kind: process
    command: gazebo
"#;
        let launch_file = LaunchFile::from_yaml(yaml).unwrap();
        assert_eq!(
            launch_file.units["simulator"].on_failure,
            FailurePolicy::FailFast
        );
    }

    #[test]
    fn test_parse_failure_policies() {
        let yaml = r#"
units:
  slam:
    command: async_slam_node
    on_failure:
      restart_limited: 2
  detector:
    command: aruco_node
    on_failure: ignore
"#;
        let launch_file = LaunchFile::from_yaml(yaml).unwrap();
        assert_eq!(
            launch_file.units["slam"].on_failure,
            FailurePolicy::RestartLimited(2)
        );
        assert_eq!(
            launch_file.units["detector"].on_failure,
            FailurePolicy::Ignore
        );
    }

    #[test]
    fn test_validation_rejects_empty_command() {
        let yaml = r#"
units:
  broken:
    command: ""
"#;
        let result = LaunchFile::from_yaml(yaml);
        assert!(matches!(result, Err(LaunchFileError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_run_to_completion_node() {
        let yaml = r#"
units:
  spawner:
    kind: node
    command: spawn_robot
    run_to_completion: true
"#;
        let result = LaunchFile::from_yaml(yaml);
        assert!(matches!(result, Err(LaunchFileError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_readiness_on_process() {
        let yaml = r#"
units:
  simulator:
    kind: process
    command: gazebo
    readiness:
      pattern: "world loaded"
"#;
        let result = LaunchFile::from_yaml(yaml);
        assert!(matches!(result, Err(LaunchFileError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_bad_readiness_pattern() {
        let yaml = r#"
units:
  slam:
    kind: node
    command: async_slam_node
    readiness:
      pattern: "map update ["
"#;
        let result = LaunchFile::from_yaml(yaml);
        assert!(matches!(result, Err(LaunchFileError::Validation(_))));
    }
}
