//! Substitution of `$(param)`, `$(env)` and `$(timestamp)` patterns in
//! launch-file strings

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `$(kind payload)` and bare `$(kind)` patterns
static PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\((\w+)(?:\s+([^)]+))?\)").unwrap());

/// Substitutions may nest; resolution loops until the string is stable
const MAX_DEPTH: usize = 8;

/// Variables available while resolving one unit's launch-file strings
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    params: HashMap<String, String>,
    env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    /// Resolve every pattern in `input`, including nested references
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();

        for _ in 0..MAX_DEPTH {
            if !current.contains("$(") {
                return Ok(current);
            }
            let next = self.substitute_once(&current)?;
            if next == current {
                return Ok(next);
            }
            current = next;
        }

        if current.contains("$(") {
            return Err(SubstitutionError::MaxDepthExceeded(input.to_string()));
        }
        Ok(current)
    }

    fn substitute_once(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            let kind = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let payload = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
            match self.resolve(kind, payload) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(result.into_owned()),
        }
    }

    fn resolve(&self, kind: &str, payload: &str) -> Result<String, SubstitutionError> {
        match kind {
            "param" => self
                .params
                .get(payload)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedParam(payload.to_string())),
            "env" => {
                if let Some(value) = self.env.get(payload) {
                    return Ok(value.clone());
                }
                std::env::var(payload)
                    .map_err(|_| SubstitutionError::UndefinedEnv(payload.to_string()))
            }
            "timestamp" => {
                let format = if payload.is_empty() {
                    "%Y%m%d_%H%M%S"
                } else {
                    payload
                };
                Ok(chrono::Local::now().format(format).to_string())
            }
            other => Err(SubstitutionError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors raised while resolving launch-file strings
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution kind: {0}")]
    UnknownKind(String),

    #[error("Undefined parameter: {0}")]
    UndefinedParam(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Substitution depth exceeded for: {0}")]
    MaxDepthExceeded(String),
}
