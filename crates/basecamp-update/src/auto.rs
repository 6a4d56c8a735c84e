//! Periodic update checks driven from a service's `run()` cadence.
//!
//! The check itself runs on a background task so a slow releaser never
//! stalls the service loop; at most one check is in flight at a time.
//! Failures are logged and the service keeps running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::updater::Updater;

/// Default interval between checks: one hour.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

pub struct AutoUpdate {
    updater: Updater,
    /// Serial of the connection to the releaser.
    serial: u64,
    interval: Mutex<Duration>,
    enabled: AtomicBool,
    last_check: Mutex<Option<Instant>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl AutoUpdate {
    pub fn new(updater: Updater, serial: u64) -> Self {
        Self {
            updater,
            serial,
            interval: Mutex::new(DEFAULT_CHECK_INTERVAL),
            enabled: AtomicBool::new(true),
            last_check: Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        let interval = *self.interval.lock().unwrap();
        tracing::info!(?interval, "auto update enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        tracing::info!("auto update disabled");
    }

    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock().unwrap() = interval;
        tracing::info!(?interval, "auto update interval changed");
    }

    /// Call once per service `run()` iteration. Spawns a background
    /// check-and-update when the interval has elapsed and no check is
    /// already running.
    pub fn tick(&self) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        {
            let last = self.last_check.lock().unwrap();
            let interval = *self.interval.lock().unwrap();
            if let Some(last) = *last {
                if last.elapsed() < interval {
                    return;
                }
            }
        }
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        *self.last_check.lock().unwrap() = Some(Instant::now());
        let updater = self.updater.clone();
        let serial = self.serial;
        *in_flight = Some(tokio::spawn(async move {
            match updater.download_and_install(serial, true).await {
                Ok(true) => tracing::info!("auto update applied, restarting"),
                Ok(false) => tracing::debug!("auto update: nothing newer"),
                Err(e) => tracing::error!(error = %e, "auto update check failed"),
            }
        }));
    }
}
