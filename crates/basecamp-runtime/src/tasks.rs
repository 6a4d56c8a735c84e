//! Named background tasks owned by a service.
//!
//! Everything a service spawns goes through the registry so shutdown can
//! cancel the whole set. Cancellation is cooperative from the outside:
//! cancel → await → swallow the cancellation, matching how the transport
//! read loops treat being cancelled as a clean exit.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::{Id, JoinHandle};

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<Vec<NamedTask>>,
}

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task and track it. Returns the tokio task id, usable with
    /// [`TaskRegistry::cancel`].
    pub fn spawn(&self, name: &str, future: impl Future<Output = ()> + Send + 'static) -> Id {
        tracing::debug!(task = name, "task spawned");
        let handle = tokio::spawn(future);
        let id = handle.id();
        self.tasks.lock().unwrap().push(NamedTask {
            name: name.to_string(),
            handle,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Cancel one task and wait for it to wind down.
    ///
    /// A task cannot cancel itself through the registry — awaiting our own
    /// cancellation would never return.
    pub async fn cancel(&self, id: Id) -> Result<(), TaskError> {
        if tokio::task::try_id() == Some(id) {
            return Err(TaskError::CancelSelf);
        }
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let index = tasks
                .iter()
                .position(|t| t.handle.id() == id)
                .ok_or(TaskError::UnknownTask)?;
            tasks.swap_remove(index)
        };
        tracing::debug!(task = %task.name, "task cancelled");
        task.handle.abort();
        let _ = task.handle.await;
        Ok(())
    }

    /// Cancel every tracked task and drain them.
    pub async fn cancel_all(&self) {
        let tasks: Vec<NamedTask> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in &tasks {
            task.handle.abort();
        }
        for task in tasks {
            tracing::debug!(task = %task.name, "task drained");
            let _ = task.handle.await;
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("cannot cancel the currently running task")]
    CancelSelf,
    #[error("task is not tracked by this registry")]
    UnknownTask,
}
