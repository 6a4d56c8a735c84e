//! Command dispatcher.
//!
//! Maps wire idents to async handlers and runs a receive loop over an
//! [`Endpoint`]. Handler execution is serialized: independent inbound
//! commands never run concurrently with each other, so handler bodies may
//! assume no concurrent peer of themselves. A handler that invokes another
//! command through [`Commander::call`] on the same dispatcher bypasses the
//! lock — the in-handler marker is task-local, which keeps the reentrancy
//! check sound on a multi-threaded runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;

use basecamp_core::wire::{Envelope, MAX_FRAME};

use crate::endpoint::{Endpoint, NetError};

type Handler = Arc<dyn Fn(Commander, Value, u64) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

tokio::task_local! {
    /// Set while a handler is executing on this task.
    static IN_HANDLER: ();
}

/// Command-based communication over an endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Commander {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    handlers: std::sync::RwLock<HashMap<String, Handler>>,
    /// Serializes top-level handler execution.
    handle_lock: tokio::sync::Mutex<()>,
    /// Idents currently executing, outermost first.
    call_stack: std::sync::Mutex<Vec<String>>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Commander {
    /// Create a commander over its own endpoint and start the receive loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::over(Endpoint::new())
    }

    /// Create a commander over an existing endpoint and start the receive
    /// loop.
    pub fn over(endpoint: Endpoint) -> Self {
        let commander = Self {
            inner: Arc::new(Inner {
                endpoint,
                handlers: std::sync::RwLock::new(HashMap::new()),
                handle_lock: tokio::sync::Mutex::new(()),
                call_stack: std::sync::Mutex::new(Vec::new()),
                recv_task: std::sync::Mutex::new(None),
            }),
        };
        let task = tokio::spawn(commander.clone().receive_loop());
        *commander.inner.recv_task.lock().unwrap() = Some(task);
        commander
    }

    /// The endpoint this commander dispatches over.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Bind a listening socket; inbound peers can then send commands.
    pub async fn bind(&self, addr: &str, port: u16) -> Result<u64, NetError> {
        self.inner.endpoint.bind(addr, port).await
    }

    /// Connect to a remote commander. Returns the data socket serial.
    pub async fn connect(&self, addr: &str, port: u16) -> Result<u64, NetError> {
        self.inner.endpoint.connect(addr, port).await
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a handler for `ident`. Registering an ident twice is an
    /// error — there is exactly one handler per wire command.
    pub fn register<F, Fut>(&self, ident: &str, handler: F) -> Result<(), CommandError>
    where
        F: Fn(Commander, Value, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |cmdr, body, serial| Box::pin(handler(cmdr, body, serial)));
        let mut handlers = self.inner.handlers.write().unwrap();
        if handlers.contains_key(ident) {
            return Err(CommandError::DuplicateIdent(ident.to_string()));
        }
        handlers.insert(ident.to_string(), boxed);
        Ok(())
    }

    /// Idents of the commands currently executing on this dispatcher,
    /// outermost first.
    pub fn call_stack(&self) -> Vec<String> {
        self.inner.call_stack.lock().unwrap().clone()
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Invoke a registered handler.
    ///
    /// Top-level calls take the handler lock; calls made from inside a
    /// handler on the same task bypass it, so a handler may invoke another
    /// command synchronously without deadlocking.
    pub async fn call(&self, ident: &str, body: Value, serial: u64) -> Result<(), CommandError> {
        let nested = IN_HANDLER.try_with(|_| ()).is_ok();
        if nested {
            self.execute(ident, body, serial).await
        } else {
            let _guard = self.inner.handle_lock.lock().await;
            IN_HANDLER.scope((), self.execute(ident, body, serial)).await
        }
    }

    async fn execute(&self, ident: &str, body: Value, serial: u64) -> Result<(), CommandError> {
        let handler = {
            let handlers = self.inner.handlers.read().unwrap();
            handlers
                .get(ident)
                .cloned()
                .ok_or_else(|| CommandError::UnknownCommand(ident.to_string()))?
        };

        self.inner.call_stack.lock().unwrap().push(ident.to_string());
        let result = handler(self.clone(), body, serial).await;
        self.inner.call_stack.lock().unwrap().pop();

        result.map_err(CommandError::Handler)
    }

    // ── Communication ────────────────────────────────────────────────────────

    /// Send a command envelope to the peer on `serial`.
    ///
    /// The encoded envelope must fit in a single frame; a body that would
    /// need chunking is rejected rather than split.
    pub async fn send_command(
        &self,
        ident: &str,
        body: Value,
        serial: u64,
    ) -> Result<(), CommandError> {
        let encoded = Envelope::new(ident, body).encode();
        if encoded.len() > MAX_FRAME {
            return Err(CommandError::EnvelopeTooLarge(encoded.len()));
        }
        self.inner.endpoint.send(&encoded, serial).await?;
        Ok(())
    }

    /// The receive loop: decode each inbound frame as an envelope and
    /// dispatch it. Bad frames and unknown idents are logged and dropped;
    /// handler failures are logged and swallowed so one bad command cannot
    /// take the loop down.
    async fn receive_loop(self) {
        loop {
            let (serial, msg) = self.inner.endpoint.recv_any().await;
            let envelope = match Envelope::decode(&msg) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(serial, error = %e, "dropping malformed envelope");
                    continue;
                }
            };
            tracing::trace!(serial, ident = %envelope.ident, "dispatching");
            match self.call(&envelope.ident, envelope.body, serial).await {
                Ok(()) => {}
                Err(CommandError::UnknownCommand(ident)) => {
                    tracing::warn!(serial, %ident, "unknown command ident, dropping");
                }
                Err(e) => {
                    tracing::warn!(serial, error = %e, "command handler failed");
                }
            }
        }
    }

    /// Stop the receive loop and close every socket.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.recv_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.endpoint.close_all().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command ident already registered: {0}")]
    DuplicateIdent(String),
    #[error("unknown command ident: {0}")]
    UnknownCommand(String),
    #[error("encoded envelope is {0} bytes, larger than one frame")]
    EnvelopeTooLarge(usize),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("command handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}
