//! Parameter sets and the broker that computes each unit's effective view

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A single parameter value.
///
/// Path-valued parameters (world files, maps, per-node configuration files)
/// are carried as strings; their contents are never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Parse a command-line value into the most specific type it matches
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") {
            return ParamValue::Bool(true);
        }
        if s.eq_ignore_ascii_case("false") {
            return ParamValue::Bool(false);
        }
        if let Ok(i) = s.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(x) = s.parse::<f64>() {
            return ParamValue::Float(x);
        }
        ParamValue::Str(s.to_string())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

/// An ordered mapping from parameter name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: IndexMap<String, ParamValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// Render every value as a string, for substitution contexts
    pub fn as_strings(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

/// Computes a unit's effective parameters from session defaults, per-unit
/// overrides and external (command line) overrides.
///
/// The merge is a pure function of its inputs: none of the underlying sets
/// are mutated, and each call recomputes the result from scratch.
#[derive(Debug, Clone, Default)]
pub struct ParameterBroker {
    session_defaults: ParameterSet,
    external_overrides: ParameterSet,
}

impl ParameterBroker {
    pub fn new(session_defaults: ParameterSet, external_overrides: ParameterSet) -> Self {
        Self {
            session_defaults,
            external_overrides,
        }
    }

    pub fn session_defaults(&self) -> &ParameterSet {
        &self.session_defaults
    }

    /// Merge order: session defaults, then the unit's own overrides, then
    /// external overrides. Later wins, key by key. External keys unknown to
    /// the session are passed through verbatim so downstream configuration
    /// schemas can pick them up.
    pub fn effective_parameters(&self, unit_overrides: &ParameterSet) -> ParameterSet {
        let mut merged = self.session_defaults.clone();
        for (name, value) in unit_overrides.iter() {
            merged.set(name.clone(), value.clone());
        }
        for (name, value) in self.external_overrides.iter() {
            merged.set(name.clone(), value.clone());
        }
        merged
    }
}
