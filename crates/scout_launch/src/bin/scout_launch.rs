//! Scout Launch CLI
//!
//! Usage:
//!   scout_launch launch/inspection.launch.yaml
//!   scout_launch launch/inspection.launch.yaml -p use_sim_time:=false
//!   scout_launch launch/inspection.launch.yaml --dry-run
//!
//! Exit codes: 0 on full success, 2 for resolution errors (bad launch file
//! or dependency graph), 1 for runtime failures.

use scout_launch::{LaunchArgs, LaunchFile, LaunchSession, OsLauncher, SessionConfig};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    // Load launch file
    log::info!("Loading launch file: {}", args.launch_file);
    let launch_file = match LaunchFile::from_file(&args.launch_file) {
        Ok(lf) => lf,
        Err(e) => {
            log::error!("Failed to load launch file: {}", e);
            std::process::exit(2);
        }
    };

    let overrides = args.param_overrides();
    let launcher = Arc::new(OsLauncher);
    let mut session = match LaunchSession::from_launch_file(
        &launch_file,
        overrides,
        launcher,
        SessionConfig::default(),
    ) {
        Ok(s) => s,
        Err(e) => {
            log::error!("Failed to build session: {}", e);
            std::process::exit(2);
        }
    };

    // Validate only mode: also exercises dependency resolution
    if args.validate {
        if let Err(e) = session.plan() {
            log::error!("Launch file '{}' is invalid: {}", args.launch_file, e);
            std::process::exit(2);
        }
        println!("Launch file '{}' is valid", args.launch_file);
        println!("  Version: {}", launch_file.version);
        println!("  Params:  {}", launch_file.params.len());
        println!("  Units:   {}", launch_file.units.len());
        return;
    }

    // Dry run mode
    if args.dry_run {
        match session.plan() {
            Ok(plan) => println!("{}", plan),
            Err(e) => {
                log::error!("Failed to resolve launch plan: {}", e);
                std::process::exit(2);
            }
        }
        return;
    }

    // Create shutdown channel and wire Ctrl+C to it
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    {
        let shutdown_tx = shutdown_tx.clone();
        ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        })
        .expect("Error setting Ctrl+C handler");
    }

    let report = match session.run(shutdown_rx).await {
        Ok(report) => report,
        Err(e) => {
            log::error!("Session failed to resolve: {}", e);
            std::process::exit(2);
        }
    };

    if args.report_json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to encode report: {}", e),
        }
    } else {
        println!("{}", report);
    }

    std::process::exit(report.exit_code());
}
