//! Single-shot event for bridging request/response over the command stream.
//!
//! The protocol has no correlation ids, so each reply ident gets one event:
//! the public updater method clears it, sends the request, and waits; the
//! reply handler fills a slot and sets it.

use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct Event {
    set: Mutex<bool>,
    notify: Notify,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            set: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn clear(&self) {
        *self.set.lock().unwrap() = false;
    }

    pub(crate) fn set(&self) {
        *self.set.lock().unwrap() = true;
        self.notify.notify_waiters();
    }

    /// Wait until set. The notified future is created before the flag check,
    /// which closes the set-between-check-and-sleep race.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.set.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}
