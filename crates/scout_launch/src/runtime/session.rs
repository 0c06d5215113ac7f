//! Launch session: ties the registry, broker, resolver and supervisor
//! together and drives one bringup from start to shutdown

use crate::config::{
    FailurePolicy, LaunchFile, ParameterBroker, ParameterSet, SubstitutionContext,
    SubstitutionError, UnitKind,
};
use crate::runtime::launcher::{SpawnRequest, UnitLauncher};
use crate::runtime::registry::{ProcessSpec, RegistryError, SpecRegistry};
use crate::runtime::resolver::{resolve, ResolveError};
use crate::runtime::supervisor::{
    RunError, Supervisor, SupervisorConfig, UnitFailure, UnitStatus,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Session-level configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub supervisor: SupervisorConfig,
    /// Interval for dependency readiness checks and exit observation
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Errors raised before any unit is spawned. No cleanup is needed when one
/// of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Substitution failed in {context}: {source}")]
    Substitution {
        context: String,
        #[source]
        source: SubstitutionError,
    },
}

/// Final per-unit outcome
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub name: String,
    pub status: UnitStatus,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<UnitFailure>,
}

/// Overall session outcome plus every unit's terminal status
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitFailure>,
    pub units: Vec<UnitReport>,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session report")?;
        writeln!(f, "==============")?;
        for unit in &self.units {
            writeln!(
                f,
                "  {:<24} {:<20} restarts: {}",
                unit.name,
                unit.status.to_string(),
                unit.restart_count
            )?;
            if let Some(failure) = &unit.failure {
                writeln!(f, "      {}: {}", failure.kind, failure.message)?;
            }
        }
        writeln!(f)?;
        writeln!(
            f,
            "Overall: {}",
            if self.success { "success" } else { "failure" }
        )?;
        if let Some(error) = &self.error {
            writeln!(f, "  {}: {}", error.kind, error.message)?;
        }
        Ok(())
    }
}

/// One unit of the dry-run plan
#[derive(Debug)]
pub struct PlanUnit {
    pub name: String,
    pub kind: UnitKind,
    pub command: String,
    pub args: Vec<String>,
    pub params: ParameterSet,
    pub dependencies: Vec<String>,
    pub policy: FailurePolicy,
}

/// Resolved start order with effective parameters, for dry-run display
#[derive(Debug)]
pub struct LaunchPlan {
    pub params: ParameterSet,
    pub units: Vec<PlanUnit>,
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;

        if !self.params.is_empty() {
            writeln!(f)?;
            writeln!(f, "Session parameters:")?;
            for (key, value) in self.params.iter() {
                writeln!(f, "  {key}: {value}")?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Units (in start order):")?;
        for (i, unit) in self.units.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "  {}. {} ({})", i + 1, unit.name, unit.kind)?;
            writeln!(f, "     Command: {} {}", unit.command, unit.args.join(" "))?;
            if !unit.dependencies.is_empty() {
                writeln!(f, "     Depends on: {}", unit.dependencies.join(", "))?;
            }
            if !unit.params.is_empty() {
                writeln!(f, "     Parameters:")?;
                for (key, value) in unit.params.iter() {
                    writeln!(f, "       {key}: {value}")?;
                }
            }
            writeln!(f, "     On failure: {}", unit.policy)?;
        }

        Ok(())
    }
}

/// The top-level object one invocation constructs: owns the specs, the
/// session parameters and the live supervisor state.
pub struct LaunchSession {
    registry: SpecRegistry,
    broker: ParameterBroker,
    supervisor: Supervisor,
    env: HashMap<String, String>,
    poll_interval: Duration,
}

impl LaunchSession {
    /// Programmatic construction; units are added with
    /// [`LaunchSession::register`]
    pub fn new(
        launcher: Arc<dyn UnitLauncher>,
        config: SessionConfig,
        session_defaults: ParameterSet,
        external_overrides: ParameterSet,
    ) -> Self {
        Self {
            registry: SpecRegistry::new(),
            broker: ParameterBroker::new(session_defaults, external_overrides),
            supervisor: Supervisor::new(launcher, config.supervisor),
            env: HashMap::new(),
            poll_interval: config.poll_interval,
        }
    }

    /// Build a session from a parsed launch file plus external overrides.
    /// Launch-file strings are substituted against each unit's effective
    /// parameters and the file's environment block.
    pub fn from_launch_file(
        launch_file: &LaunchFile,
        external_overrides: ParameterSet,
        launcher: Arc<dyn UnitLauncher>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(
            launcher,
            config,
            launch_file.params.clone(),
            external_overrides,
        );

        for (name, unit) in &launch_file.units {
            let effective = session.broker.effective_parameters(&unit.params);
            let ctx = SubstitutionContext::new()
                .with_params(effective.as_strings())
                .with_envs(launch_file.env.clone());

            let subst = |value: &str, what: &str| -> Result<String, SessionError> {
                ctx.substitute(value).map_err(|e| SessionError::Substitution {
                    context: format!("unit '{name}' {what}"),
                    source: e,
                })
            };

            let command = subst(&unit.command, "command")?;
            let mut args = Vec::with_capacity(unit.args.len());
            for arg in &unit.args {
                args.push(subst(arg, "args")?);
            }

            // Global environment first, unit entries win
            let mut env = HashMap::new();
            for (key, value) in &launch_file.env {
                env.insert(key.clone(), subst(value, "env")?);
            }
            for (key, value) in &unit.env {
                env.insert(key.clone(), subst(value, "env")?);
            }

            session.registry.register(ProcessSpec {
                name: name.clone(),
                kind: unit.kind,
                command,
                args,
                params: unit.params.clone(),
                env,
                working_dir: unit.working_dir.clone().map(PathBuf::from),
                depends_on: unit.depends_on.clone(),
                startup_delay_ms: unit.startup_delay_ms,
                run_to_completion: unit.run_to_completion,
                readiness: unit.readiness.clone(),
                on_failure: unit.on_failure,
            })?;
        }

        Ok(session)
    }

    pub fn register(&mut self, spec: ProcessSpec) -> Result<(), RegistryError> {
        self.registry.register(spec)
    }

    /// Resolve the start order and compute every unit's effective
    /// parameters, without spawning anything
    pub fn plan(&self) -> Result<LaunchPlan, SessionError> {
        let order = resolve(&self.registry)?;
        let units = order
            .iter()
            .map(|spec| PlanUnit {
                name: spec.name.clone(),
                kind: spec.kind,
                command: spec.command.clone(),
                args: spec.args.clone(),
                params: self.broker.effective_parameters(&spec.params),
                dependencies: spec.depends_on.clone(),
                policy: spec.on_failure,
            })
            .collect();

        Ok(LaunchPlan {
            params: self.broker.session_defaults().clone(),
            units,
        })
    }

    /// Start every unit in resolved order, supervise until shutdown or
    /// abort, then terminate everything in reverse start order.
    ///
    /// Resolution errors are returned before anything is spawned; run-phase
    /// failures are reflected in the report.
    pub async fn run(
        &mut self,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<SessionReport, SessionError> {
        let order = resolve(&self.registry)?;
        log::info!("Launching {} units", order.len());

        for (index, spec) in order.iter().enumerate() {
            self.supervisor.track(&spec.name, index);
        }

        let mut outcome: Option<RunError> = None;
        let mut cancelled = false;

        'units: for spec in &order {
            if shutdown_rx.has_changed().unwrap_or(false) {
                log::info!("Shutdown requested, cancelling pending starts");
                cancelled = true;
                break;
            }

            // Wait for dependencies to be running. A run-to-completion
            // dependency that already finished cleanly also satisfies.
            let mut blocked: Option<String> = None;
            for dep_name in &spec.depends_on {
                loop {
                    if shutdown_rx.has_changed().unwrap_or(false) {
                        cancelled = true;
                        break 'units;
                    }
                    if let Err(err) = self.dispatch_exits(&order).await {
                        outcome = Some(err);
                        break 'units;
                    }
                    let dep_runs_to_completion = order
                        .iter()
                        .find(|s| &s.name == dep_name)
                        .is_some_and(|s| s.run_to_completion);
                    match self.supervisor.status_of(dep_name) {
                        Some(UnitStatus::Running) => break,
                        Some(UnitStatus::Stopped(Some(0))) if dep_runs_to_completion => break,
                        Some(UnitStatus::Failed) | Some(UnitStatus::Stopped(_)) => {
                            blocked = Some(dep_name.clone());
                            break;
                        }
                        _ => tokio::time::sleep(self.poll_interval).await,
                    }
                }
                if blocked.is_some() {
                    break;
                }
            }

            if let Some(dep) = blocked {
                log::warn!(
                    "[{}] Dependency '{dep}' is not available; unit stays pending",
                    spec.name
                );
                self.supervisor.mark_blocked(&spec.name, &dep);
                continue;
            }

            if let Some(delay) = spec.startup_delay_ms {
                log::debug!("[{}] Waiting {delay}ms before start", spec.name);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            // Effective parameters are computed freshly at launch time
            let request = self.spawn_request(spec);
            if let Err(err) = self.supervisor.start_unit(spec, &request).await {
                outcome = Some(err);
                break;
            }
        }

        // Supervision phase: observe exits and apply policies until a
        // shutdown signal, an abort, or nothing is left running
        if outcome.is_none() && !cancelled {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        log::info!("Shutdown signal received");
                        break;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {
                        if let Err(err) = self.dispatch_exits(&order).await {
                            outcome = Some(err);
                            break;
                        }
                        if !self.supervisor.any_active() {
                            log::info!("All units have settled");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(err) = &outcome {
            log::error!("Aborting session: {err}");
        }
        self.supervisor.shutdown().await;

        Ok(self.build_report(outcome))
    }

    /// Observe exits and run each crashed unit through its failure policy
    async fn dispatch_exits(&mut self, order: &[ProcessSpec]) -> Result<(), RunError> {
        for (name, code) in self.supervisor.poll_exits() {
            let Some(index) = self.supervisor.spec_index_of(&name) else {
                continue;
            };
            let Some(spec) = order.get(index) else {
                continue;
            };
            let request = self.spawn_request(spec);
            self.supervisor
                .on_unexpected_exit(spec, &request, code)
                .await?;
        }
        Ok(())
    }

    fn spawn_request(&self, spec: &ProcessSpec) -> SpawnRequest {
        let params = self.broker.effective_parameters(&spec.params);
        let mut env = self.env.clone();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        SpawnRequest::from_spec(spec, params, env)
    }

    fn build_report(&self, outcome: Option<RunError>) -> SessionReport {
        let mut success = outcome.is_none();
        let mut units = Vec::new();
        for unit in self.supervisor.units() {
            let failed = unit.status == UnitStatus::Failed
                || (unit.status == UnitStatus::Pending && unit.failure.is_some());
            if failed {
                success = false;
            }
            units.push(UnitReport {
                name: unit.name.clone(),
                status: unit.status,
                restart_count: unit.restart_count,
                failure: unit.failure.clone(),
            });
        }
        SessionReport {
            success,
            error: outcome.map(|err| UnitFailure {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
            units,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParamValue;
    use crate::runtime::fake::{Behavior, FakeLauncher};

    fn test_session(launcher: Arc<FakeLauncher>) -> LaunchSession {
        let config = SessionConfig {
            supervisor: SupervisorConfig {
                grace_period: Duration::from_millis(50),
                readiness_timeout: Duration::from_millis(50),
                restart_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            poll_interval: Duration::from_millis(5),
        };
        LaunchSession::new(launcher, config, ParameterSet::new(), ParameterSet::new())
    }

    /// Trigger shutdown once the given number of units has spawned
    fn shutdown_after_spawns(
        launcher: Arc<FakeLauncher>,
        tx: watch::Sender<()>,
        spawns: usize,
    ) {
        tokio::spawn(async move {
            loop {
                let seen = launcher
                    .events()
                    .iter()
                    .filter(|e| e.starts_with("spawn:"))
                    .count();
                if seen >= spawns {
                    let _ = tx.send(());
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_chain_starts_in_order_and_stops_in_reverse() {
        let launcher = FakeLauncher::new();
        let mut session = test_session(launcher.clone());
        session.register(ProcessSpec::process("a", "bin/a")).unwrap();
        session
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();
        session
            .register(ProcessSpec::node("c", "bin/c").needs("b"))
            .unwrap();

        let (tx, rx) = watch::channel(());
        shutdown_after_spawns(launcher.clone(), tx, 3);

        let report = session.run(rx).await.unwrap();
        assert!(report.success);
        assert_eq!(
            launcher.events(),
            vec![
                "spawn:a",
                "spawn:b",
                "spawn:c",
                "terminate:c",
                "terminate:b",
                "terminate:a"
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_crash_terminates_running_and_leaves_rest_pending() {
        let launcher = FakeLauncher::new();
        launcher.script("b", Behavior::Exit(Some(1)));
        let mut session = test_session(launcher.clone());
        session.register(ProcessSpec::node("a", "bin/a")).unwrap();
        session.register(ProcessSpec::node("b", "bin/b")).unwrap();
        session
            .register(ProcessSpec::node("c", "bin/c").needs("a").needs("b"))
            .unwrap();

        let (_tx, rx) = watch::channel(());
        let report = session.run(rx).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.error.as_ref().map(|e| e.kind.as_str()), Some("unexpected_exit"));

        let status_of = |name: &str| {
            report
                .units
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.status)
        };
        // The already-running unit was terminated before the session
        // reported failure; the never-started unit stayed pending
        assert!(matches!(status_of("a"), Some(UnitStatus::Stopped(_))));
        assert_eq!(status_of("b"), Some(UnitStatus::Failed));
        assert_eq!(status_of("c"), Some(UnitStatus::Pending));

        let events = launcher.events();
        assert_eq!(events, vec!["spawn:a", "spawn:b", "terminate:a"]);
    }

    #[tokio::test]
    async fn test_restart_limited_unit_recovers_and_reports_restarts() {
        let launcher = FakeLauncher::new();
        launcher.script("slam", Behavior::FailSpawns(2));
        let mut session = test_session(launcher.clone());
        session
            .register(
                ProcessSpec::node("slam", "slam_node")
                    .policy(FailurePolicy::RestartLimited(2)),
            )
            .unwrap();

        let (tx, rx) = watch::channel(());
        shutdown_after_spawns(launcher.clone(), tx, 1);

        let report = session.run(rx).await.unwrap();
        assert!(report.success);

        let slam = report.units.iter().find(|u| u.name == "slam").unwrap();
        assert_eq!(slam.restart_count, 2);
        assert!(matches!(slam.status, UnitStatus::Stopped(_)));
    }

    #[tokio::test]
    async fn test_one_shot_unit_completes_and_session_succeeds() {
        let launcher = FakeLauncher::new();
        launcher.script("spawner", Behavior::Exit(Some(0)));
        let mut session = test_session(launcher.clone());
        session
            .register(ProcessSpec::process("spawner", "spawn_robot").one_shot())
            .unwrap();

        let (_tx, rx) = watch::channel(());
        let report = session.run(rx).await.unwrap();

        assert!(report.success);
        assert_eq!(report.units[0].status, UnitStatus::Stopped(Some(0)));
    }

    #[tokio::test]
    async fn test_one_shot_dependency_satisfies_dependent_after_completion() {
        let launcher = FakeLauncher::new();
        launcher.script("spawner", Behavior::Exit(Some(0)));
        let mut session = test_session(launcher.clone());
        session
            .register(ProcessSpec::process("spawner", "spawn_robot").one_shot())
            .unwrap();
        session
            .register(ProcessSpec::node("slam", "slam_node").needs("spawner"))
            .unwrap();

        let (tx, rx) = watch::channel(());
        shutdown_after_spawns(launcher.clone(), tx, 2);

        let report = session.run(rx).await.unwrap();
        assert!(report.success);
        assert!(launcher.events().contains(&"spawn:slam".to_string()));
    }

    #[tokio::test]
    async fn test_ignored_failure_leaves_dependents_pending() {
        let launcher = FakeLauncher::new();
        launcher.script("a", Behavior::Exit(Some(1)));
        let mut session = test_session(launcher.clone());
        session
            .register(ProcessSpec::node("a", "bin/a").policy(FailurePolicy::Ignore))
            .unwrap();
        session
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();

        let (_tx, rx) = watch::channel(());
        let report = session.run(rx).await.unwrap();

        assert!(!report.success);
        let b = report.units.iter().find(|u| u.name == "b").unwrap();
        assert_eq!(b.status, UnitStatus::Pending);
        assert_eq!(
            b.failure.as_ref().map(|f| f.kind.as_str()),
            Some("dependency_unavailable")
        );
        assert!(!launcher.events().contains(&"spawn:b".to_string()));
    }

    #[tokio::test]
    async fn test_cycle_fails_before_anything_spawns() {
        let launcher = FakeLauncher::new();
        let mut session = test_session(launcher.clone());
        session
            .register(ProcessSpec::node("a", "bin/a").needs("b"))
            .unwrap();
        session
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();

        let (_tx, rx) = watch::channel(());
        let result = session.run(rx).await;

        assert!(matches!(
            result,
            Err(SessionError::Resolve(ResolveError::CyclicDependency(_)))
        ));
        assert!(launcher.events().is_empty());
    }

    #[tokio::test]
    async fn test_from_launch_file_substitutes_and_merges_params() {
        let yaml = r#"
params:
  use_sim_time: true
  world_file: "worlds/industry.world"
units:
  simulator:
    kind: process
    command: gazebo
    args: ["--verbose", "$(param world_file)"]
  slam:
    command: slam_node
    params:
      use_sim_time: false
    depends_on:
      - simulator
"#;
        let launch_file = LaunchFile::from_yaml(yaml).unwrap();
        let launcher = FakeLauncher::new();
        let overrides = ParameterSet::new().with("map_file", ParamValue::Str("m.yaml".into()));
        let session = LaunchSession::from_launch_file(
            &launch_file,
            overrides,
            launcher,
            SessionConfig::default(),
        )
        .unwrap();

        let plan = session.plan().unwrap();
        assert_eq!(plan.units.len(), 2);

        let simulator = &plan.units[0];
        assert_eq!(simulator.name, "simulator");
        assert_eq!(simulator.args[1], "worlds/industry.world");
        assert_eq!(
            simulator.params.get("use_sim_time"),
            Some(&ParamValue::Bool(true))
        );

        // The unit override beats the session default; the external
        // override is passed through to every unit
        let slam = &plan.units[1];
        assert_eq!(
            slam.params.get("use_sim_time"),
            Some(&ParamValue::Bool(false))
        );
        assert_eq!(
            slam.params.get("map_file"),
            Some(&ParamValue::Str("m.yaml".into()))
        );
    }

    #[tokio::test]
    async fn test_plan_is_deterministic() {
        let launcher = FakeLauncher::new();
        let mut session = test_session(launcher);
        session.register(ProcessSpec::node("a", "bin/a")).unwrap();
        session
            .register(ProcessSpec::node("b", "bin/b").needs("a"))
            .unwrap();

        let first: Vec<String> = session
            .plan()
            .unwrap()
            .units
            .iter()
            .map(|u| u.name.clone())
            .collect();
        let second: Vec<String> = session
            .plan()
            .unwrap()
            .units
            .iter()
            .map(|u| u.name.clone())
            .collect();
        assert_eq!(first, second);
    }
}
