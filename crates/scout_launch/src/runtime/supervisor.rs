//! Process supervision: the per-unit state machine, failure policies and
//! reverse-order shutdown

use crate::config::{FailurePolicy, UnitKind};
use crate::runtime::launcher::{SpawnFailure, SpawnRequest, UnitHandle, UnitLauncher};
use crate::runtime::registry::ProcessSpec;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle states of one managed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped(Option<i32>),
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Stopped(_) | UnitStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UnitStatus::Starting | UnitStatus::Running | UnitStatus::Stopping
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Pending => f.write_str("pending"),
            UnitStatus::Starting => f.write_str("starting"),
            UnitStatus::Running => f.write_str("running"),
            UnitStatus::Stopping => f.write_str("stopping"),
            UnitStatus::Stopped(Some(code)) => write!(f, "stopped (status {code})"),
            UnitStatus::Stopped(None) => f.write_str("stopped"),
            UnitStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Errors raised while units are starting or running
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Spawn(#[from] SpawnFailure),

    #[error("Unit '{unit}' did not become ready within {timeout_ms}ms")]
    ReadinessTimeout { unit: String, timeout_ms: u64 },

    #[error("Unit '{unit}' exited unexpectedly with status {code:?}")]
    UnexpectedExit { unit: String, code: Option<i32> },
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Spawn(_) => "spawn",
            RunError::ReadinessTimeout { .. } => "readiness_timeout",
            RunError::UnexpectedExit { .. } => "unexpected_exit",
        }
    }
}

/// Terminal failure details, kept for the final report
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub kind: String,
    pub message: String,
}

/// Supervisor timing knobs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace period before an escalated forced termination
    pub grace_period: Duration,
    /// Readiness deadline for nodes that do not configure their own
    pub readiness_timeout: Duration,
    /// Base delay before a restart attempt; doubles per attempt
    pub restart_backoff: Duration,
    /// Upper bound on the restart backoff
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(30),
            restart_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Runtime state of one launched unit
pub struct ProcessHandle {
    pub name: String,
    pub status: UnitStatus,
    /// Re-attempts performed so far, across start and run failures
    pub restart_count: u32,
    pub pid: Option<u32>,
    /// Index into the resolved spec list, for policy lookups
    pub spec_index: usize,
    pub failure: Option<UnitFailure>,
    handle: Option<Box<dyn UnitHandle>>,
}

/// Owns every launched OS resource. No other component spawns or
/// terminates units; the process table is only touched from the session's
/// coordinating task.
pub struct Supervisor {
    launcher: Arc<dyn UnitLauncher>,
    config: SupervisorConfig,
    units: IndexMap<String, ProcessHandle>,
    /// Names in the order units actually reached running, for reverse-order
    /// shutdown
    started: Vec<String>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn UnitLauncher>, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            units: IndexMap::new(),
            started: Vec::new(),
        }
    }

    /// Begin tracking a unit in `Pending`
    pub fn track(&mut self, name: &str, spec_index: usize) {
        self.units
            .entry(name.to_string())
            .or_insert_with(|| ProcessHandle {
                name: name.to_string(),
                status: UnitStatus::Pending,
                restart_count: 0,
                pid: None,
                spec_index,
                failure: None,
                handle: None,
            });
    }

    pub fn status_of(&self, name: &str) -> Option<UnitStatus> {
        self.units.get(name).map(|unit| unit.status)
    }

    pub fn spec_index_of(&self, name: &str) -> Option<usize> {
        self.units.get(name).map(|unit| unit.spec_index)
    }

    pub fn units(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.units.values()
    }

    pub fn any_active(&self) -> bool {
        self.units.values().any(|unit| unit.status.is_active())
    }

    /// Start a unit, applying its failure policy to start errors.
    ///
    /// `Ok(true)` means the unit is running; `Ok(false)` means it failed but
    /// the failure is ignored by policy. `Err` aborts the session.
    pub async fn start_unit(
        &mut self,
        spec: &ProcessSpec,
        request: &SpawnRequest,
    ) -> Result<bool, RunError> {
        self.set_status(&spec.name, UnitStatus::Starting);
        match self.try_start_once(spec, request).await {
            Ok(()) => Ok(true),
            Err(err) => self.apply_policy(spec, request, err).await,
        }
    }

    /// Apply the failure policy after an unexpected exit observed while the
    /// unit was running. Same result convention as [`Supervisor::start_unit`].
    pub async fn on_unexpected_exit(
        &mut self,
        spec: &ProcessSpec,
        request: &SpawnRequest,
        code: Option<i32>,
    ) -> Result<bool, RunError> {
        let err = RunError::UnexpectedExit {
            unit: spec.name.clone(),
            code,
        };
        self.apply_policy(spec, request, err).await
    }

    /// Sweep exit notifications. Clean zero-status exits transition to
    /// `Stopped`; crashes transition to `Failed` and are returned for policy
    /// handling.
    pub fn poll_exits(&mut self) -> Vec<(String, Option<i32>)> {
        let mut crashed = Vec::new();
        for (name, unit) in self.units.iter_mut() {
            if unit.status != UnitStatus::Running {
                continue;
            }
            let Some(handle) = unit.handle.as_mut() else {
                continue;
            };
            if let Some(code) = handle.try_wait() {
                unit.pid = None;
                unit.handle = None;
                if code == Some(0) {
                    log::info!("[{name}] Exited cleanly");
                    unit.status = UnitStatus::Stopped(Some(0));
                } else {
                    log::error!("[{name}] Exited unexpectedly with status {code:?}");
                    unit.status = UnitStatus::Failed;
                    crashed.push((name.clone(), code));
                }
            }
        }
        crashed
    }

    /// Record that a unit can never start because a dependency is gone.
    /// The unit stays `Pending`.
    pub fn mark_blocked(&mut self, name: &str, dependency: &str) {
        if let Some(unit) = self.units.get_mut(name) {
            unit.failure = Some(UnitFailure {
                kind: "dependency_unavailable".to_string(),
                message: format!("dependency '{dependency}' is not available"),
            });
        }
    }

    /// Terminate units in exact reverse start order, regardless of why
    /// shutdown was triggered.
    pub async fn shutdown(&mut self) {
        if self.started.is_empty() {
            return;
        }
        log::info!("Shutting down in reverse start order...");
        let names: Vec<String> = self.started.iter().rev().cloned().collect();
        for name in names {
            self.stop_unit(&name).await;
        }
        log::info!("All units shut down");
    }

    async fn stop_unit(&mut self, name: &str) {
        let Some(unit) = self.units.get_mut(name) else {
            return;
        };
        if unit.status != UnitStatus::Running {
            return;
        }
        unit.status = UnitStatus::Stopping;
        if let Some(mut handle) = unit.handle.take() {
            log::info!("[{name}] Stopping");
            let code = handle.terminate(self.config.grace_period).await;
            unit.status = UnitStatus::Stopped(code);
            log::info!("[{name}] Stopped with status {code:?}");
        } else {
            unit.status = UnitStatus::Stopped(None);
        }
        unit.pid = None;
    }

    async fn try_start_once(
        &mut self,
        spec: &ProcessSpec,
        request: &SpawnRequest,
    ) -> Result<(), RunError> {
        log::info!(
            "[{}] Starting: {} {}",
            spec.name,
            request.command,
            request.args.join(" ")
        );
        let mut handle = self.launcher.spawn(request.clone()).await?;

        if spec.kind == UnitKind::Node {
            if let Some(readiness) = &spec.readiness {
                let deadline = readiness
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.config.readiness_timeout);
                match tokio::time::timeout(deadline, handle.ready()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let code = handle.try_wait().flatten();
                        return Err(RunError::UnexpectedExit {
                            unit: spec.name.clone(),
                            code,
                        });
                    }
                    Err(_) => {
                        // The half-started unit is reaped before it is
                        // declared failed, so nothing is orphaned
                        handle.terminate(self.config.grace_period).await;
                        return Err(RunError::ReadinessTimeout {
                            unit: spec.name.clone(),
                            timeout_ms: deadline.as_millis() as u64,
                        });
                    }
                }
            }
        }

        let pid = handle.pid();
        if let Some(unit) = self.units.get_mut(&spec.name) {
            unit.pid = pid;
            unit.handle = Some(handle);
            unit.status = UnitStatus::Running;
            unit.failure = None;
        }
        if !self.started.iter().any(|name| name == &spec.name) {
            self.started.push(spec.name.clone());
        }
        match pid {
            Some(pid) => log::info!("[{}] Running (pid {pid})", spec.name),
            None => log::info!("[{}] Running", spec.name),
        }
        Ok(())
    }

    /// Retry under `RestartLimited` with bounded backoff, then settle the
    /// failure according to policy.
    async fn apply_policy(
        &mut self,
        spec: &ProcessSpec,
        request: &SpawnRequest,
        mut err: RunError,
    ) -> Result<bool, RunError> {
        let budget = match spec.on_failure {
            FailurePolicy::RestartLimited(n) => n,
            _ => 0,
        };

        loop {
            let attempts = match self.units.get(&spec.name) {
                Some(unit) => unit.restart_count,
                None => break,
            };
            if attempts >= budget {
                break;
            }
            let delay = self.backoff_delay(attempts + 1);
            log::warn!(
                "[{}] {err}; retry {}/{budget} in {delay:?}",
                spec.name,
                attempts + 1
            );
            tokio::time::sleep(delay).await;
            if let Some(unit) = self.units.get_mut(&spec.name) {
                unit.restart_count = attempts + 1;
                unit.status = UnitStatus::Starting;
            }
            match self.try_start_once(spec, request).await {
                Ok(()) => return Ok(true),
                Err(e) => err = e,
            }
        }

        let failure = UnitFailure {
            kind: err.kind().to_string(),
            message: err.to_string(),
        };
        if let Some(unit) = self.units.get_mut(&spec.name) {
            unit.status = UnitStatus::Failed;
            unit.failure = Some(failure);
        }
        match spec.on_failure {
            FailurePolicy::Ignore => {
                log::error!("[{}] {err} (ignored by policy)", spec.name);
                Ok(false)
            }
            _ => Err(err),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.config.restart_backoff.saturating_mul(1 << exponent);
        delay.min(self.config.max_backoff)
    }

    fn set_status(&mut self, name: &str, status: UnitStatus) {
        if let Some(unit) = self.units.get_mut(name) {
            unit.status = status;
        }
    }
}
