// ABOUTME: Socket worker factory: owns the relay listener and the PID registry, and spawns workers.
// ABOUTME: A spawn starts the process, waits for its relay by PID, and kills + reaps it on failure.

use crate::config::FactoryConfig;
use crate::endpoint::{Endpoint, RelayListener};
use crate::error::{FactoryError, MultiError, Result};
use crate::listener;
use crate::registry::PidRegistry;
use crate::worker::{ProcessSpec, Worker, WorkerState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the listener error channel. The listener reports at most one error.
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Spawns worker processes and pairs each with the relay connection it opens back to us.
///
/// Workers learn the endpoint out of band (usually via [`crate::RELAY_ENV`]), connect, and
/// send their PID as the first frame. The factory matches that PID against the process
/// it started.
pub struct Factory {
    endpoint: Endpoint,
    registry: Arc<PidRegistry>,
    relay_timeout: Duration,
    shutdown: CancellationToken,
    closed: AtomicBool,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    errors: Mutex<Option<mpsc::Receiver<FactoryError>>>,
}

impl Factory {
    /// Bind the configured endpoint and start accepting relays.
    pub async fn bind(config: &FactoryConfig) -> Result<Self> {
        let endpoint: Endpoint = config.relay.parse()?;
        let listener = RelayListener::bind(&endpoint).await?;
        Self::new(listener, config.relay_timeout(), config.handshake_timeout())
    }

    /// Attach a factory to an already bound listener and start accepting relays.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        relay_listener: RelayListener,
        relay_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = relay_listener.local_endpoint()?;
        let registry = Arc::new(PidRegistry::new());
        let shutdown = CancellationToken::new();
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let task = tokio::spawn(listener::run(
            relay_listener,
            registry.clone(),
            handshake_timeout,
            shutdown.clone(),
            error_tx,
        ));

        Ok(Self {
            endpoint,
            registry,
            relay_timeout,
            shutdown,
            closed: AtomicBool::new(false),
            listener_task: Mutex::new(Some(task)),
            errors: Mutex::new(Some(error_rx)),
        })
    }

    /// Endpoint workers must connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn relay_timeout(&self) -> Duration {
        self.relay_timeout
    }

    /// Relays that completed their handshake but have not been claimed by a spawn.
    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receiver for the listener's terminal error. Returns `None` after the first call.
    ///
    /// A listener failure is not retried; whoever holds this decides what to do.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<FactoryError>> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Start a worker and wait for its relay.
    ///
    /// Bounded by the relay timeout. On any failure after the process started, the
    /// process is killed and reaped before this returns.
    pub async fn spawn(&self, spec: ProcessSpec) -> Result<Worker> {
        self.spawn_with_cancel(spec, &CancellationToken::new()).await
    }

    /// Like [`Factory::spawn`], but also returns as soon as `cancel` fires.
    ///
    /// On cancellation this returns [`FactoryError::Cancelled`] right away, without
    /// waiting for the process to be cleaned up. The background spawn task sees the
    /// same token and kills and reaps the process immediately. If the relay won the
    /// race, the finished worker is killed and reaped instead, because nobody is left
    /// to receive it.
    pub async fn spawn_with_cancel(
        &self,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<Worker> {
        if self.is_closed() {
            return Err(FactoryError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(FactoryError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.relay_timeout;
        let caller_cancel = cancel.clone();

        tokio::spawn(async move {
            let result = spawn_worker(spec, &registry, timeout, &shutdown, &caller_cancel).await;
            if let Err(Ok(mut worker)) = tx.send(result) {
                tracing::debug!(pid = ?worker.pid(), "Spawn abandoned by caller, reclaiming worker");
                let kill = worker.kill().await;
                let wait = worker.wait().await.map(|_| ());
                if let Some(e) = MultiError::combine([kill, wait]) {
                    tracing::warn!(pid = ?worker.pid(), error = %e, "Failed to reclaim abandoned worker");
                }
            }
        });

        tokio::select! {
            biased;

            result = rx => match result {
                Ok(result) => result,
                Err(_) => Err(FactoryError::SpawnTask(
                    "spawn task exited without a result".to_string(),
                )),
            },
            _ = cancel.cancelled() => {
                tracing::debug!("Spawn cancelled by caller");
                Err(FactoryError::Cancelled)
            }
        }
    }

    /// Stop accepting relays and release the endpoint.
    ///
    /// Spawns still waiting for a relay fail with [`FactoryError::Closed`] (their
    /// processes are killed). Unclaimed relays are dropped. Closing twice returns
    /// `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(FactoryError::Closed);
        }
        self.shutdown.cancel();

        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Relay listener task did not shut down cleanly");
            }
        }

        let orphans = self.registry.drain();
        if !orphans.is_empty() {
            let pids: Vec<i64> = orphans.iter().map(|(pid, _)| *pid).collect();
            tracing::info!(?pids, "Dropped unclaimed relays");
        }

        tracing::info!(endpoint = %self.endpoint, "Factory closed");
        Ok(())
    }
}

impl Drop for Factory {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The spawn routine shared by both entry points.
async fn spawn_worker(
    spec: ProcessSpec,
    registry: &PidRegistry,
    timeout: Duration,
    shutdown: &CancellationToken,
    cancel: &CancellationToken,
) -> Result<Worker> {
    let mut worker = Worker::new(spec);
    worker.start()?;

    let Some(pid) = worker.pid() else {
        return Err(abort(&mut worker, FactoryError::NotStarted).await);
    };

    let waited = tokio::select! {
        claimed = tokio::time::timeout(timeout, registry.claim(pid)) => {
            claimed.map_err(|_| FactoryError::RelayTimeout { pid, timeout })
        }
        _ = shutdown.cancelled() => Err(FactoryError::Closed),
        _ = cancel.cancelled() => Err(FactoryError::Cancelled),
    };

    let relay = match waited {
        Ok(relay) => relay,
        Err(cause) => {
            let err = abort(&mut worker, cause).await;
            // The relay may have been published after we stopped waiting.
            registry.remove(pid);
            return Err(err);
        }
    };

    if !worker.is_alive() {
        let status = worker
            .exit_status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(abort(&mut worker, FactoryError::ExitedEarly { pid, status }).await);
    }

    worker.attach_relay(relay);
    worker.set_state(WorkerState::Ready);
    tracing::debug!(pid, elapsed = ?worker.created().elapsed(), "Worker ready");
    Ok(worker)
}

/// Kill and reap a worker that failed to spawn, folding every failure into one error.
async fn abort(worker: &mut Worker, cause: FactoryError) -> FactoryError {
    tracing::warn!(pid = ?worker.pid(), error = %cause, "Spawn failed, killing worker");
    let kill = worker.kill().await;
    let wait = worker.wait().await.map(|_| ());
    MultiError::aggregate(cause, [kill, wait])
}
