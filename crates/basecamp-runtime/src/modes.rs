//! Agent entry modes.
//!
//! The first CLI token selects the mode: `run` (default), `build`,
//! `release`, or `apply`. The launcher turns a parsed mode into the right
//! orchestration — lifecycle for run, the bundle builder for build, catalog
//! transitions for release, and the self-replacement path for apply.
//!
//! Exit codes: 0 success, 1 unknown mode or mode failure, 2 build/release
//! attempted from a bundled executable.

use std::path::{Path, PathBuf};

use basecamp_core::config::BasecampConfig;
use basecamp_update::apply;
use basecamp_update::store::ReleaseStore;

use crate::build::Builder;
use crate::service::{Service, ServiceHost};
use crate::svcctl;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FORBIDDEN_IN_BUNDLE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Run(RunOptions),
    Build(BuildOptions),
    Release(ReleaseOptions),
    Apply,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub log_level: Option<String>,
    pub config_file: Option<PathBuf>,
    pub install: bool,
    pub uninstall: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub version: String,
    /// Bundler output to package; defaults to `dist/` under the root.
    pub dist_path: Option<PathBuf>,
    pub release_path: Option<PathBuf>,
    pub exclude_patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOptions {
    pub version: String,
    pub approve: bool,
    pub release_path: Option<PathBuf>,
    pub release_notes: Option<String>,
    pub rollback_target: Option<String>,
}

impl Mode {
    /// Parse the arguments after the program name. No mode token means
    /// `run`.
    pub fn parse(args: &[String]) -> Result<Mode, ModeError> {
        let (token, rest) = match args.split_first() {
            None => return Ok(Mode::Run(RunOptions::default())),
            Some((first, rest)) if !first.starts_with('-') => (first.as_str(), rest),
            // a leading flag belongs to run mode
            Some(_) => ("run", args),
        };

        match token {
            "run" => Ok(Mode::Run(parse_run(rest)?)),
            "build" => Ok(Mode::Build(parse_build(rest)?)),
            "release" => Ok(Mode::Release(parse_release(rest)?)),
            "apply" => Ok(Mode::Apply),
            other => Err(ModeError::UnknownMode(other.to_string())),
        }
    }
}

fn parse_run(args: &[String]) -> Result<RunOptions, ModeError> {
    let mut options = RunOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-l" | "--log_level" => options.log_level = Some(value(&mut iter, arg)?),
            "-c" | "--config_file" => options.config_file = Some(PathBuf::from(value(&mut iter, arg)?)),
            "--install" => options.install = true,
            "--uninstall" => options.uninstall = true,
            other => return Err(ModeError::UnknownOption("run", other.to_string())),
        }
    }
    Ok(options)
}

fn parse_build(args: &[String]) -> Result<BuildOptions, ModeError> {
    let mut version = None;
    let mut dist_path = None;
    let mut release_path = None;
    let mut exclude_patterns: Option<Vec<String>> = None;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--version" => version = Some(value(&mut iter, arg)?),
            "-f" | "--dist_path" => dist_path = Some(PathBuf::from(value(&mut iter, arg)?)),
            "-p" | "--release_path" => release_path = Some(PathBuf::from(value(&mut iter, arg)?)),
            "-e" | "--exclude-patterns" => {
                let patterns = exclude_patterns.get_or_insert_with(Vec::new);
                while let Some(next) = iter.peek() {
                    if next.starts_with('-') {
                        break;
                    }
                    patterns.push(iter.next().unwrap().clone());
                }
            }
            "-o" | "--bundler-options" => {
                // bundler options are consumed for CLI compatibility; the
                // bundler runs outside this process
                while let Some(next) = iter.peek() {
                    if next.starts_with('-') {
                        break;
                    }
                    let option = iter.next().unwrap();
                    tracing::warn!(%option, "ignoring bundler option (bundler is external)");
                }
            }
            other => return Err(ModeError::UnknownOption("build", other.to_string())),
        }
    }
    Ok(BuildOptions {
        version: version.ok_or(ModeError::MissingVersion("build"))?,
        dist_path,
        release_path,
        exclude_patterns,
    })
}

fn parse_release(args: &[String]) -> Result<ReleaseOptions, ModeError> {
    let mut version = None;
    let mut approve = false;
    let mut release_path = None;
    let mut release_notes = None;
    let mut rollback_target = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--version" => version = Some(value(&mut iter, arg)?),
            "-a" | "--approve" => approve = true,
            "-p" | "--release_path" => release_path = Some(PathBuf::from(value(&mut iter, arg)?)),
            "-n" | "--release_notes" => release_notes = Some(value(&mut iter, arg)?),
            "-r" | "--rollback_target" => rollback_target = Some(value(&mut iter, arg)?),
            other => return Err(ModeError::UnknownOption("release", other.to_string())),
        }
    }
    Ok(ReleaseOptions {
        version: version.ok_or(ModeError::MissingVersion("release"))?,
        approve,
        release_path,
        release_notes,
        rollback_target,
    })
}

fn value<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> Result<String, ModeError> {
    iter.next()
        .map(|s| s.to_string())
        .ok_or_else(|| ModeError::MissingValue(flag.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModeError {
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("unknown {0} option: {1}")]
    UnknownOption(&'static str, String),
    #[error("{0} requires a value")]
    MissingValue(String),
    #[error("{0} requires -v VERSION")]
    MissingVersion(&'static str),
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Ties a service implementation to the mode machinery.
pub struct Launcher {
    name: String,
    root: Option<PathBuf>,
    bundled: bool,
}

impl Launcher {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: None,
            bundled: std::env::var_os("BASECAMP_BUNDLED").is_some(),
        }
    }

    /// Override the install root (defaults to the running executable's
    /// directory).
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Mark this binary as a packaged release. Build and release modes are
    /// developer operations and refuse to run from a bundle.
    pub fn bundled(mut self, bundled: bool) -> Self {
        self.bundled = bundled;
        self
    }

    /// Execute a parsed mode. Returns the process exit code.
    pub fn dispatch(self, mode: Mode, service: &mut dyn Service) -> i32 {
        let root = match self.resolve_root() {
            Ok(root) => root,
            Err(e) => {
                tracing::error!(error = %e, "cannot determine install root");
                return EXIT_FAILURE;
            }
        };

        match mode {
            Mode::Run(options) => self.run_mode(&root, options, service),
            Mode::Build(options) => {
                if self.bundled {
                    tracing::error!("build mode is not available from a bundled executable");
                    return EXIT_FORBIDDEN_IN_BUNDLE;
                }
                self.build_mode(&root, options)
            }
            Mode::Release(options) => {
                if self.bundled {
                    tracing::error!("release mode is not available from a bundled executable");
                    return EXIT_FORBIDDEN_IN_BUNDLE;
                }
                self.release_mode(&root, options)
            }
            Mode::Apply => self.apply_mode(&root),
        }
    }

    /// Convenience wrapper: parse then dispatch.
    pub fn dispatch_args(self, args: &[String], service: &mut dyn Service) -> i32 {
        match Mode::parse(args) {
            Ok(mode) => self.dispatch(mode, service),
            Err(e) => {
                eprintln!("{e}");
                EXIT_FAILURE
            }
        }
    }

    fn resolve_root(&self) -> std::io::Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => ServiceHost::install_root_from_exe(),
        }
    }

    fn run_mode(&self, root: &Path, options: RunOptions, service: &mut dyn Service) -> i32 {
        let config_path = options
            .config_file
            .map(|p| if p.is_absolute() { p } else { root.join(p) });

        if options.install || options.uninstall {
            let result = if options.install {
                svcctl::service_install(&self.name, root)
            } else {
                svcctl::service_uninstall(&self.name)
            };
            return match result {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    tracing::error!(error = %e, "service registration failed");
                    EXIT_FAILURE
                }
            };
        }

        let host = match ServiceHost::new(&self.name, root, config_path) {
            Ok(host) => host,
            Err(e) => {
                tracing::error!(error = %e, "config load failed");
                return EXIT_FAILURE;
            }
        };
        if let Err(e) = BasecampConfig::write_default_if_missing(host.config_path()) {
            tracing::warn!(error = %e, "could not materialise default config");
        }

        match host.on(service) {
            Ok(()) => EXIT_OK,
            Err(e) => {
                tracing::error!(error = %e, "service failed");
                EXIT_FAILURE
            }
        }
    }

    fn build_mode(&self, root: &Path, options: BuildOptions) -> i32 {
        let builder = Builder::new(&self.name, root, options.release_path);
        let result = builder.build(
            &options.version,
            options.dist_path.as_deref(),
            options.exclude_patterns.as_deref(),
        );
        match result {
            Ok(dir) => {
                println!("built {} v{} -> {}", self.name, options.version, dir.display());
                EXIT_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "build failed");
                EXIT_FAILURE
            }
        }
    }

    fn release_mode(&self, root: &Path, options: ReleaseOptions) -> i32 {
        let release_path = options
            .release_path
            .unwrap_or_else(|| root.join("releases"));
        let store = match ReleaseStore::open(&release_path) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "cannot open release catalog");
                return EXIT_FAILURE;
            }
        };

        let manifest = if options.approve {
            store.approve(
                &options.version,
                options.release_notes.as_deref(),
                options.rollback_target.as_deref(),
            )
        } else {
            store.manifest(&options.version)
        };

        match manifest {
            Ok(manifest) => {
                if options.approve {
                    println!("version {} approved", options.version);
                }
                println!("version:  {}", manifest.version);
                println!("status:   {:?}", manifest.status);
                println!("built:    {}", manifest.build_time);
                println!("platform: {}", manifest.platform);
                println!(
                    "files:    {} ({} bytes)",
                    manifest.files.len(),
                    manifest.total_size()
                );
                if !manifest.release_notes.is_empty() {
                    println!("notes:    {}", manifest.release_notes);
                }
                if let Some(target) = &manifest.rollback_target {
                    println!("rollback: {target}");
                }
                EXIT_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "release failed");
                EXIT_FAILURE
            }
        }
    }

    fn apply_mode(&self, root: &Path) -> i32 {
        let config_path = BasecampConfig::file_path(root);
        let update_path = match BasecampConfig::load(&config_path) {
            Ok(config) => {
                let p = config.service.update_path;
                if p.is_absolute() {
                    p
                } else {
                    root.join(p)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config unreadable in apply mode, using default stage root");
                root.join("updates")
            }
        };

        match apply::run(root, &update_path) {
            Ok(()) => EXIT_OK,
            Err(e) => {
                tracing::error!(error = %e, "apply failed");
                EXIT_FAILURE
            }
        }
    }
}
