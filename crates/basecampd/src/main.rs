//! basecampd — reference Basecamp agent.
//!
//! One binary covers both ends of the update pipeline:
//!
//! - with `BASECAMPD_LISTEN` set it binds the command port and serves its
//!   release catalog (`releaser.release_path`),
//! - with `BASECAMPD_RELEASER` set it connects out, checks for updates
//!   periodically, and replaces itself when a newer approved version
//!   appears.
//!
//! Modes: `basecampd [run|build|release|apply] ...` — `run` is the default.

mod agent;

use std::process::ExitCode;

use basecamp_core::config::BasecampConfig;
use basecamp_runtime::modes::EXIT_FAILURE;
use basecamp_runtime::{Launcher, Mode, ServiceHost};

use agent::AgentService;

fn print_usage() {
    println!("Usage: basecampd [mode] [options]");
    println!();
    println!("Modes (default: run)");
    println!("  run     [-l LEVEL] [-c CONFIG] [--install] [--uninstall]");
    println!("  build   -v VERSION [-f DIST_PATH] [-p RELEASE_PATH] [-e PATTERN...]");
    println!("  release -v VERSION [-a] [-p RELEASE_PATH] [-n NOTES] [-r ROLLBACK_TARGET]");
    println!("  apply   (consumes the staged update; no user arguments)");
    println!();
    println!("Environment:");
    println!("  BASECAMPD_LISTEN    host:port to serve the release catalog on");
    println!("  BASECAMPD_RELEASER  host:port of a releaser to follow for updates");
    println!("  BASECAMP_CONFIG     config file override (default: basecamp.toml next to the binary)");
    println!("  RUST_LOG            log filter (overrides -l and the config)");
}

fn init_tracing(mode: &Mode) {
    // precedence: RUST_LOG > -l flag > config log_level > "info"
    let fallback = match mode {
        Mode::Run(options) => options.log_level.clone(),
        _ => None,
    }
    .or_else(|| {
        let root = ServiceHost::install_root_from_exe().ok()?;
        let config = BasecampConfig::load(&BasecampConfig::file_path(&root)).ok()?;
        Some(config.service.log_level)
    })
    .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match Mode::parse(&args) {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            return ExitCode::from(EXIT_FAILURE as u8);
        }
    };

    init_tracing(&mode);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "basecampd starting");

    let mut service = AgentService::default();
    let code = Launcher::new("basecampd").dispatch(mode, &mut service);
    ExitCode::from(code as u8)
}
