//! Registry of launchable unit specifications

use crate::config::{FailurePolicy, ParamValue, ParameterSet, ReadinessConfig, UnitKind};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::PathBuf;

/// Declarative description of one launchable unit
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unit name, unique within a session
    pub name: String,
    /// Bare OS process or managed service node
    pub kind: UnitKind,
    /// Executable path or name resolved via PATH
    pub command: String,
    /// Arguments passed to the executable, in order
    pub args: Vec<String>,
    /// Per-unit parameter overrides
    pub params: ParameterSet,
    /// Environment variables for this unit
    pub env: HashMap<String, String>,
    /// Working directory for the process
    pub working_dir: Option<PathBuf>,
    /// Units that must be running before this one starts
    pub depends_on: Vec<String>,
    /// Startup delay in milliseconds after dependencies are ready
    pub startup_delay_ms: Option<u64>,
    /// Bare process that is expected to finish on its own with status zero
    pub run_to_completion: bool,
    /// Readiness detection for managed nodes
    pub readiness: Option<ReadinessConfig>,
    /// What to do when this unit fails
    pub on_failure: FailurePolicy,
}

impl ProcessSpec {
    fn new(name: impl Into<String>, command: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            name: name.into(),
            kind,
            command: command.into(),
            args: Vec::new(),
            params: ParameterSet::new(),
            env: HashMap::new(),
            working_dir: None,
            depends_on: Vec::new(),
            startup_delay_ms: None,
            run_to_completion: false,
            readiness: None,
            on_failure: FailurePolicy::default(),
        }
    }

    /// A managed service node
    pub fn node(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, command, UnitKind::Node)
    }

    /// A bare OS process
    pub fn process(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, command, UnitKind::Process)
    }

    pub fn param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn needs(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Mark a bare process as run-to-completion
    pub fn one_shot(mut self) -> Self {
        self.run_to_completion = true;
        self
    }

    pub fn ready_when(mut self, pattern: impl Into<String>, timeout_ms: u64) -> Self {
        self.readiness = Some(ReadinessConfig {
            pattern: pattern.into(),
            timeout_ms: Some(timeout_ms),
        });
        self
    }
}

/// Errors raised by the registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A unit named '{0}' is already registered")]
    DuplicateName(String),

    #[error("No unit named '{0}' is registered")]
    NotFound(String),
}

/// In-memory store of specs. Registration order is preserved for
/// diagnostics and resolver tie-breaking; execution order is always the
/// resolver's output.
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: IndexMap<String, ProcessSpec>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ProcessSpec) -> Result<(), RegistryError> {
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ProcessSpec, RegistryError> {
        self.specs
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Specs in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.specs.values()
    }
}
