//! Command execution.
//!
//! A single controller thread owns the keyspace and runs commands one at a
//! time, in arrival order. Searches and CAS inserts may hand their heavy
//! part to a worker thread; workers report back through the controller's
//! channel, so every mutation of a set still happens on the controller.

mod controller;
mod insert;
pub mod keyspace;
pub mod metrics;
mod reflect;
pub mod replication;
pub mod reply;
mod search;
pub mod snapshot;
mod worker;

pub use reply::Reply;
pub use search::{effective_ef, SearchParams};

use crate::config::Config;
use crate::vset::{IndexParams, VsetError};
use anyhow::Context;
use controller::Controller;
use keyspace::Keyspace;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A command and its arguments, each an arbitrary byte string.
pub type Args = Vec<Vec<u8>>;

#[derive(Clone)]
pub struct Engine(Arc<Inner>);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
    #[error(transparent)]
    Vset(#[from] VsetError),
    #[error("engine is shutting down")]
    Stopped,
}

/// Execution context of a command. Replicated commands and commands run
/// inside a transaction or script never use worker threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandContext {
    pub replicated: bool,
    pub transaction: bool,
}

impl CommandContext {
    pub fn replicated() -> Self {
        Self {
            replicated: true,
            transaction: false,
        }
    }

    pub fn allows_background(&self) -> bool {
        !self.replicated && !self.transaction
    }
}

pub(crate) enum ControlMsg {
    Command {
        args: Args,
        ctx: CommandContext,
        reply: reply::ReplySender,
    },
    InsertPrepared(insert::TwoPhaseInsert),
    Save(oneshot::Sender<Result<(), EngineError>>),
    Shutdown,
}

struct Inner {
    config: Config,
    tx: mpsc::UnboundedSender<ControlMsg>,
    metrics: Arc<metrics::Metrics>,
    replication: Arc<replication::ReplicationLog>,
    controller: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let metrics = Arc::new(metrics::Metrics::default());
        let replication = Arc::new(replication::ReplicationLog::new(config.replication_backlog));
        let mut keyspace = Keyspace::new(IndexParams::from_config(&config));

        let snapshot_path = config.snapshot_path();
        if let Some(path) = &snapshot_path {
            if path.exists() {
                let loaded = snapshot::load_snapshot(path, &mut keyspace)
                    .with_context(|| format!("load snapshot {}", path.display()))?;
                tracing::info!(keys = loaded, path = %path.display(), "snapshot loaded");
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Controller::new(
            config.clone(),
            keyspace,
            metrics.clone(),
            replication.clone(),
            tx.clone(),
            snapshot_path.clone(),
        );
        let handle = std::thread::Builder::new()
            .name("vset-controller".to_string())
            .spawn(move || controller.run(rx))
            .context("spawn controller thread")?;

        let engine = Self(Arc::new(Inner {
            config,
            tx,
            metrics,
            replication,
            controller: Mutex::new(Some(handle)),
            shutdown,
        }));
        if snapshot_path.is_some() {
            engine.start_snapshot_task_if_runtime();
        }
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn health(&self) -> &'static str {
        "ok"
    }

    pub fn metrics(&self) -> Arc<metrics::Metrics> {
        self.0.metrics.clone()
    }

    pub fn metrics_text(&self) -> String {
        self.0.metrics.render()
    }

    pub fn replication(&self) -> &replication::ReplicationLog {
        &self.0.replication
    }

    /// Queues a command; the receiver resolves once it has a reply. A
    /// stopped engine drops the sender, which the receiver sees as an error.
    pub fn submit(&self, args: Args, ctx: CommandContext) -> oneshot::Receiver<Reply> {
        let (reply, rx) = oneshot::channel();
        let _ = self.0.tx.send(ControlMsg::Command { args, ctx, reply });
        rx
    }

    pub async fn execute(&self, args: Args, ctx: CommandContext) -> Reply {
        self.submit(args, ctx)
            .await
            .unwrap_or_else(|_| Reply::Error(format!("ERR {}", EngineError::Stopped)))
    }

    /// Blocking variant of [`Engine::execute`]. Must not be called from
    /// inside an async task.
    pub fn execute_blocking(&self, args: Args, ctx: CommandContext) -> Reply {
        self.submit(args, ctx)
            .blocking_recv()
            .unwrap_or_else(|_| Reply::Error(format!("ERR {}", EngineError::Stopped)))
    }

    /// Convenience wrapper for [`Engine::execute_blocking`] with a default
    /// context.
    pub fn command<I, A>(&self, parts: I) -> Reply
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        let args = parts.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self.execute_blocking(args, CommandContext::default())
    }

    /// Applies a command received from a primary.
    pub fn apply_replicated(&self, args: Args) -> Reply {
        self.execute_blocking(args, CommandContext::replicated())
    }

    pub async fn save(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.0
            .tx
            .send(ControlMsg::Save(done))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub fn save_blocking(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.0
            .tx
            .send(ControlMsg::Save(done))
            .map_err(|_| EngineError::Stopped)?;
        rx.blocking_recv().map_err(|_| EngineError::Stopped)?
    }

    /// Stops background tasks and the controller, which writes a final
    /// snapshot when a data directory is configured. Idempotent.
    pub fn shutdown(&self) {
        self.0.shutdown.cancel();
        self.0.stop_controller();
    }

    fn start_snapshot_task_if_runtime(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let interval_secs = self.0.config.snapshot_interval_secs.max(1);
        let weak = Arc::downgrade(&self.0);
        let shutdown = self.0.shutdown.clone();

        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(interval_secs);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let engine = Engine(inner);
                        match engine.save().await {
                            Ok(()) => tracing::debug!("snapshot ok"),
                            Err(err) => tracing::warn!(error = %err, "snapshot failed"),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("snapshot task stopping");
                        break;
                    }
                }
            }
        });
    }
}

impl Inner {
    fn stop_controller(&self) {
        let Some(handle) = self.controller.lock().take() else {
            return;
        };
        let _ = self.tx.send(ControlMsg::Shutdown);
        if handle.join().is_err() {
            tracing::error!("controller thread panicked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.stop_controller();
    }
}
