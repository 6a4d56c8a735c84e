//! Service lifecycle.
//!
//! A service moves through Initting → Running → Stopping → Stopped. An
//! `init` failure sets the stop flag so the run loop is never entered; a
//! `destroy` failure is logged but the service still reaches Stopped.
//!
//! Closers — callbacks like "spawn the apply-mode successor" — run only
//! after the tokio runtime has been dropped. At that point no task is
//! alive, sockets are closed, and file handles are released, so the
//! successor can safely start replacing files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use basecamp_core::config::BasecampConfig;
use basecamp_update::install;
use basecamp_update::updater::RestartHandle;

use crate::tasks::TaskRegistry;

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Initting,
    Running,
    Stopping,
    Stopped,
}

/// User-implemented service logic. `run` is called in a loop until the
/// service is stopped.
#[async_trait]
pub trait Service: Send {
    async fn init(&mut self, host: &ServiceHost) -> anyhow::Result<()> {
        let _ = host;
        Ok(())
    }

    async fn run(&mut self, host: &ServiceHost) -> anyhow::Result<()>;

    async fn destroy(&mut self, host: &ServiceHost) -> anyhow::Result<()> {
        let _ = host;
        Ok(())
    }
}

/// Everything a running service shares with its components: identity,
/// install root, configuration, task registry, stop flag, and closers.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServiceHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    name: String,
    root: PathBuf,
    config_path: PathBuf,
    config: Mutex<BasecampConfig>,
    status: Mutex<Status>,
    stopped: AtomicBool,
    stop_signal: Notify,
    tasks: TaskRegistry,
    closers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ServiceHost {
    /// Create a host rooted at `root` (the install root). The config file
    /// is loaded from `config_path`, or the default location under the
    /// root.
    pub fn new(
        name: &str,
        root: impl Into<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, basecamp_core::config::ConfigError> {
        let root = root.into();
        let config_path = config_path.unwrap_or_else(|| BasecampConfig::file_path(&root));
        let config = BasecampConfig::load(&config_path)?;

        Ok(Self {
            inner: Arc::new(HostInner {
                name: name.to_string(),
                root,
                config_path,
                config: Mutex::new(config),
                status: Mutex::new(Status::Created),
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                tasks: TaskRegistry::new(),
                closers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Install root: the directory of the running executable unless the
    /// embedding binary overrode it.
    pub fn install_root_from_exe() -> std::io::Result<PathBuf> {
        let exe = std::env::current_exe()?;
        Ok(exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Resolve a path against the install root; absolute paths pass
    /// through.
    pub fn path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.inner.root.join(path)
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    pub fn config(&self) -> BasecampConfig {
        self.inner.config.lock().unwrap().clone()
    }

    pub fn version(&self) -> String {
        self.inner.config.lock().unwrap().service.version.clone()
    }

    /// Absolute stage root (`service.update_path` resolved against the
    /// install root).
    pub fn update_path(&self) -> PathBuf {
        self.path(&self.config().service.update_path)
    }

    /// Absolute release catalog root.
    pub fn release_path(&self) -> PathBuf {
        self.path(&self.config().releaser.release_path)
    }

    pub fn status(&self) -> Status {
        *self.inner.status.lock().unwrap()
    }

    fn set_status(&self, status: Status) {
        tracing::info!(service = %self.inner.name, ?status, "status");
        *self.inner.status.lock().unwrap() = status;
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.inner.tasks
    }

    /// Has stop been requested?
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until stop is requested.
    pub async fn wait_stop(&self) {
        loop {
            let notified = self.inner.stop_signal.notified();
            if self.stopped() {
                return;
            }
            notified.await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Run the service to completion on a fresh runtime, then run closers.
    ///
    /// This is the blocking entry point. The runtime is dropped before any
    /// closer runs — the spawn-successor closer depends on this ordering.
    pub fn on(&self, service: &mut dyn Service) -> anyhow::Result<()> {
        if cfg!(windows) {
            match install::sweep_pending_renames(&self.inner.root) {
                Ok(0) => {}
                Ok(n) => tracing::info!(swapped = n, "applied pending updates"),
                Err(e) => tracing::error!(error = %e, "pending update sweep failed"),
            }
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        tracing::info!(service = %self.inner.name, "service starting");

        runtime.block_on(self.serve(service));
        runtime.block_on(self.inner.tasks.cancel_all());
        drop(runtime);

        self.run_closers();
        tracing::info!(service = %self.inner.name, "service exited");
        Ok(())
    }

    /// The lifecycle state machine, usable directly from an existing
    /// runtime (tests do this; `on` wraps it for binaries).
    pub async fn serve(&self, service: &mut dyn Service) {
        self.spawn_signal_watcher();

        self.set_status(Status::Initting);
        if let Err(e) = service.init(self).await {
            tracing::error!(error = %e, "init failed");
            self.stop();
        }

        if !self.stopped() {
            self.set_status(Status::Running);
            while !self.stopped() {
                tokio::select! {
                    result = service.run(self) => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "run failed");
                            break;
                        }
                    }
                    () = self.wait_stop() => break,
                }
            }
        }

        self.set_status(Status::Stopping);
        if let Err(e) = service.destroy(self).await {
            tracing::error!(error = %e, "destroy failed");
        }
        self.set_status(Status::Stopped);
    }

    fn spawn_signal_watcher(&self) {
        let host = self.clone();
        self.inner.tasks.spawn("signal-watcher", async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received");
            host.stop();
        });
    }

    /// Request a stop. Safe from any task or thread; also used as the
    /// SIGTERM handler.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_waiters();
    }

    /// Register a callback to run after the runtime has shut down.
    /// Closers run in registration order, exactly once.
    pub fn append_closer(&self, closer: Box<dyn FnOnce() + Send>) {
        self.inner.closers.lock().unwrap().push(closer);
    }

    fn run_closers(&self) {
        let closers: Vec<_> = std::mem::take(&mut *self.inner.closers.lock().unwrap());
        for closer in closers {
            closer();
        }
    }
}

impl RestartHandle for ServiceHost {
    fn append_closer(&self, closer: Box<dyn FnOnce() + Send>) {
        ServiceHost::append_closer(self, closer);
    }

    fn stop(&self) {
        ServiceHost::stop(self);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
