//! Collaborator seam for spawning and observing OS-level units
//!
//! The supervisor is the only caller of these traits. The OS-backed
//! implementation covers both bare processes and managed nodes; tests use a
//! scripted double implementing the same traits.

use crate::config::{ParameterSet, ReadinessConfig, UnitKind};
use crate::runtime::registry::ProcessSpec;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

/// Everything handed to the launcher when spawning one unit
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub kind: UnitKind,
    pub command: String,
    pub args: Vec<String>,
    /// Effective parameters, passed through without interpretation
    pub params: ParameterSet,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub readiness: Option<ReadinessConfig>,
}

impl SpawnRequest {
    /// Build a request from a spec plus its launch-time parameters and
    /// environment
    pub fn from_spec(spec: &ProcessSpec, params: ParameterSet, env: HashMap<String, String>) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            command: spec.command.clone(),
            args: spec.args.clone(),
            params,
            env,
            working_dir: spec.working_dir.clone(),
            readiness: spec.readiness.clone(),
        }
    }
}

/// A spawn that could not be performed
#[derive(Debug, thiserror::Error)]
#[error("Failed to spawn '{name}': {source}")]
pub struct SpawnFailure {
    pub name: String,
    #[source]
    pub source: std::io::Error,
}

/// Handle to one spawned unit, owned exclusively by the supervisor
#[async_trait]
pub trait UnitHandle: Send {
    /// OS process id, when one exists
    fn pid(&self) -> Option<u32>;

    /// Wait for the unit's readiness signal. Returns immediately with `true`
    /// when the unit has no readiness configuration; returns `false` when
    /// the unit went away before signaling.
    async fn ready(&mut self) -> bool;

    /// Poll for exit without blocking. `None` means still running.
    fn try_wait(&mut self) -> Option<Option<i32>>;

    /// Graceful termination with a bounded grace period, escalating to a
    /// forced kill. Returns the collected exit status when available.
    async fn terminate(&mut self, grace: Duration) -> Option<i32>;
}

/// Spawns units on behalf of the supervisor
#[async_trait]
pub trait UnitLauncher: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn UnitHandle>, SpawnFailure>;
}

/// Launcher backed by real OS processes via `tokio::process`.
///
/// Node parameters are rendered as repeated `--param key:=value` arguments;
/// readiness is detected by matching the configured pattern against the
/// node's stdout.
#[derive(Debug, Default)]
pub struct OsLauncher;

#[async_trait]
impl UnitLauncher for OsLauncher {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn UnitHandle>, SpawnFailure> {
        let ready_pattern = match request.readiness.as_ref() {
            Some(readiness) => Some(Regex::new(&readiness.pattern).map_err(|e| SpawnFailure {
                name: request.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })?),
            None => None,
        };

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args);
        if request.kind == UnitKind::Node {
            for (key, value) in request.params.iter() {
                cmd.arg("--param").arg(format!("{key}:={value}"));
            }
        }
        cmd.envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| SpawnFailure {
            name: request.name.clone(),
            source: e,
        })?;
        let pid = child.id();

        let ready_rx = match ready_pattern {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                spawn_stdout_drain(&mut child, &request.name, ready_pattern, Some(tx));
                Some(rx)
            }
            None => {
                spawn_stdout_drain(&mut child, &request.name, None, None);
                None
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let name = request.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[{name}] {line}");
                }
            });
        }

        Ok(Box::new(OsUnitHandle {
            name: request.name,
            pid,
            child,
            ready_rx,
        }))
    }
}

/// Drain stdout into the log, signaling readiness when the pattern matches
fn spawn_stdout_drain(
    child: &mut Child,
    name: &str,
    pattern: Option<Regex>,
    ready_tx: Option<oneshot::Sender<()>>,
) {
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let name = name.to_string();
    let mut ready_tx = ready_tx;
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(re) = &pattern {
                if ready_tx.is_some() && re.is_match(&line) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            log::info!("[{name}] {line}");
        }
    });
}

struct OsUnitHandle {
    name: String,
    pid: Option<u32>,
    child: Child,
    ready_rx: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl UnitHandle for OsUnitHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn ready(&mut self) -> bool {
        match self.ready_rx.take() {
            None => true,
            Some(rx) => rx.await.is_ok(),
        }
    }

    fn try_wait(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                log::error!("[{}] Error checking process status: {e}", self.name);
                None
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                log::error!("[{}] Error waiting for process: {e}", self.name);
                None
            }
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within the grace period, killing",
                    self.name
                );
                let _ = self.child.start_kill();
                match self.child.wait().await {
                    Ok(status) => status.code(),
                    Err(_) => None,
                }
            }
        }
    }
}
