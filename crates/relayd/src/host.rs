// ABOUTME: `relayd serve` and `relayd worker`: host a worker pool, or act as one worker.
// ABOUTME: The host spawns the pool through the factory and tears it down on ctrl-c or listener failure.

use crate::client;
use crate::config::{Config, PoolConfig, RELAY_ENV};
use crate::endpoint::Endpoint;
use crate::error::FactoryError;
use crate::factory::Factory;
use crate::worker::{ProcessSpec, Worker};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::PathBuf;

/// Options for running the host
pub struct ServeOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    /// Override the configured worker count
    pub num_workers: Option<usize>,
}

/// Options for running as a worker (normally spawned by the host)
pub struct WorkerOptions {
    /// Endpoint to connect back to
    pub relay: String,
}

/// Run the host: bind the factory, spawn the pool, and wait for shutdown.
pub async fn run_serve(options: ServeOptions) -> Result<()> {
    let config_path = options.config_path.unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;
    if let Some(n) = options.num_workers {
        config.pool.num_workers = n;
    }

    let factory = Factory::bind(&config.factory)
        .await
        .context("Failed to start relay factory")?;
    let mut errors = factory
        .take_errors()
        .context("Factory error channel already taken")?;

    let spec = worker_spec(&config.pool, factory.endpoint())?;
    let mut workers = spawn_pool(&factory, &spec, config.pool.num_workers).await;
    if workers.is_empty() && config.pool.num_workers > 0 {
        let _ = factory.close().await;
        anyhow::bail!("No workers could be started");
    }
    tracing::info!(
        ready = workers.len(),
        endpoint = %factory.endpoint(),
        "Worker pool ready"
    );

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down");
            Ok(())
        }
        Some(e) = errors.recv() => Err(anyhow::Error::new(e).context("Relay listener failed")),
    };

    stop_pool(&mut workers, config.pool.stop_grace()).await;
    match factory.close().await {
        Ok(()) | Err(FactoryError::Closed) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to close factory"),
    }
    outcome
}

/// Run as a worker: connect to the host, handshake, and serve until stopped.
pub async fn run_worker(options: WorkerOptions) -> Result<()> {
    let endpoint: Endpoint = options.relay.parse()?;
    let pid = i64::from(std::process::id());
    let relay = client::connect(&endpoint, pid)
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;
    client::serve(&relay, pid).await?;
    Ok(())
}

/// Launch spec for pool workers. An empty command runs this binary in worker mode.
pub fn worker_spec(pool: &PoolConfig, endpoint: &Endpoint) -> Result<ProcessSpec> {
    let spec = match pool.command.split_first() {
        Some((program, args)) => ProcessSpec::new(program).args(args),
        None => {
            let exe = std::env::current_exe().context("Failed to locate relayd executable")?;
            ProcessSpec::new(exe).arg("worker")
        }
    };

    let spec = pool
        .env
        .iter()
        .fold(spec, |spec, (key, value)| spec.env(key, value));
    Ok(spec.env(RELAY_ENV, endpoint.to_string()))
}

async fn spawn_pool(factory: &Factory, spec: &ProcessSpec, count: usize) -> Vec<Worker> {
    let results = join_all((0..count).map(|_| factory.spawn(spec.clone()))).await;

    let mut workers = Vec::with_capacity(count);
    for result in results {
        match result {
            Ok(worker) => {
                tracing::info!(pid = ?worker.pid(), "Worker ready");
                workers.push(worker);
            }
            Err(e) => tracing::error!(error = %e, "Failed to spawn worker"),
        }
    }
    workers
}

async fn stop_pool(workers: &mut [Worker], grace: std::time::Duration) {
    let results = join_all(workers.iter_mut().map(|w| async move {
        let pid = w.pid();
        (pid, w.stop(grace).await)
    }))
    .await;

    for (pid, result) in results {
        if let Err(e) = result {
            tracing::warn!(?pid, error = %e, "Failed to stop worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_spec_uses_configured_command() {
        let mut pool = PoolConfig::default();
        pool.command = vec!["php".to_string(), "worker.php".to_string()];
        pool.env.insert("APP_ENV".to_string(), "test".to_string());

        let spec = worker_spec(&pool, &Endpoint::tcp("127.0.0.1:6001")).unwrap();
        assert_eq!(spec.program(), "php");
        let debug = format!("{spec:?}");
        assert!(debug.contains("worker.php"));
        assert!(debug.contains("APP_ENV"));
        assert!(debug.contains(RELAY_ENV));
        assert!(debug.contains("tcp://127.0.0.1:6001"));
    }

    #[test]
    fn test_worker_spec_defaults_to_self() {
        let spec = worker_spec(&PoolConfig::default(), &Endpoint::unix("/tmp/r.sock")).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(spec.program(), exe.as_os_str());
        assert!(format!("{spec:?}").contains("\"worker\""));
    }
}
