//! Scout Launch System
//!
//! A dependency-ordered launch orchestrator for the scout inspection robot
//! stack.
//!
//! # Overview
//!
//! A launch file declares the processes and service nodes that make up a
//! bringup (simulator, robot spawner, SLAM, marker detection, navigation),
//! their parameters and their startup dependencies. The runtime:
//! - resolves an explicit dependency graph into a deterministic start order
//! - merges session parameters (such as a simulated-time flag) into every
//!   unit, with per-unit and command-line override precedence
//! - supervises liveness and applies a per-unit failure policy
//! - tears everything down in reverse start order on shutdown
//!
//! # Example Launch File
//!
//! ```yaml
//! version: "1.0"
//!
//! params:
//!   use_sim_time: true
//!   world_file: "worlds/industry.world"
//!
//! units:
//!   simulator:
//!     kind: process
//!     command: gazebo
//!     args: ["--verbose", "$(param world_file)"]
//!
//!   slam:
//!     kind: node
//!     command: async_slam_node
//!     on_failure:
//!       restart_limited: 2
//!     depends_on:
//!       - simulator
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::LaunchArgs;
pub use config::{
    FailurePolicy, LaunchFile, LaunchFileError, ParamValue, ParameterBroker, ParameterSet,
    ReadinessConfig, SubstitutionContext, SubstitutionError, UnitKind,
};
pub use runtime::{
    resolve, LaunchPlan, LaunchSession, OsLauncher, ProcessHandle, ProcessSpec, RegistryError,
    ResolveError, RunError, SessionConfig, SessionError, SessionReport, SpawnFailure,
    SpawnRequest, SpecRegistry, Supervisor, SupervisorConfig, UnitHandle, UnitLauncher,
    UnitReport, UnitStatus,
};
