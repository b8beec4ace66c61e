// ABOUTME: Accept loop that pairs incoming relay connections with worker PIDs.
// ABOUTME: Handshakes run concurrently; the first accept or handshake failure ends the loop.

use crate::endpoint::RelayListener;
use crate::error::{FactoryError, Result};
use crate::registry::PidRegistry;
use crate::relay::Relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Accept relay connections until `shutdown` fires or something fails.
///
/// Returns `Ok(())` on shutdown. Any accept error or failed handshake is returned as
/// the terminal error; the loop does not retry. Handshakes still in flight at exit
/// are aborted.
///
/// A connection that never sends its pid frame, such as a port scanner or a health
/// check, fails its handshake after `handshake_timeout` and so ends the listener.
pub async fn serve(
    listener: RelayListener,
    registry: Arc<PidRegistry>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut handshakes: JoinSet<Result<(i64, Relay)>> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Relay listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let relay = accepted.map_err(FactoryError::Accept)?;
                handshakes.spawn(async move {
                    let pid = relay.fetch_pid(handshake_timeout).await?;
                    Ok((pid, relay))
                });
            }
            Some(joined) = handshakes.join_next() => {
                let (pid, relay) = joined
                    .map_err(|e| FactoryError::Handshake(format!("handshake task failed: {e}")))??;
                tracing::debug!(pid, "Relay handshake complete");
                registry.put(pid, relay);
            }
        }
    }
}

/// Run [`serve`] and report a terminal failure on `errors`.
///
/// The report is sent at most once; a clean shutdown sends nothing.
pub(crate) async fn run(
    listener: RelayListener,
    registry: Arc<PidRegistry>,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    errors: tokio::sync::mpsc::Sender<FactoryError>,
) {
    let endpoint = listener
        .local_endpoint()
        .map(|e| e.to_string())
        .unwrap_or_default();
    tracing::info!(%endpoint, "Relay listener started");

    if let Err(e) = serve(listener, registry, handshake_timeout, shutdown).await {
        tracing::error!(%endpoint, error = %e, "Relay listener failed");
        if errors.try_send(e).is_err() {
            tracing::warn!("Relay listener error was not delivered, receiver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::relay::Frame;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    struct Harness {
        _dir: tempfile::TempDir,
        endpoint: Endpoint,
        registry: Arc<PidRegistry>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(handshake_timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::unix(dir.path().join("relay.sock"));
        let listener = RelayListener::bind(&endpoint).await.unwrap();
        let registry = Arc::new(PidRegistry::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            registry.clone(),
            handshake_timeout,
            shutdown.clone(),
        ));
        Harness {
            _dir: dir,
            endpoint,
            registry,
            shutdown,
            task,
        }
    }

    #[tokio::test]
    async fn test_handshake_publishes_relay() {
        let harness = start(Duration::from_secs(1)).await;

        let worker = harness.endpoint.connect().await.unwrap();
        worker.announce_pid(1234).await.unwrap();

        let relay = tokio::time::timeout(Duration::from_secs(1), harness.registry.claim(1234))
            .await
            .expect("relay should be published");

        relay
            .send(&Frame::Payload {
                body: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            worker.receive().await.unwrap(),
            Some(Frame::Payload {
                body: "hello".to_string()
            })
        );

        harness.shutdown.cancel();
        assert!(harness.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_slow_handshake_does_not_block_others() {
        let harness = start(Duration::from_secs(5)).await;

        let _silent = harness.endpoint.connect().await.unwrap();
        let worker = harness.endpoint.connect().await.unwrap();
        worker.announce_pid(55).await.unwrap();

        let claimed =
            tokio::time::timeout(Duration::from_secs(1), harness.registry.claim(55)).await;
        assert!(claimed.is_ok());
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_handshake_ends_loop() {
        let harness = start(Duration::from_secs(1)).await;
        let Endpoint::Unix(path) = &harness.endpoint else {
            unreachable!()
        };

        let mut raw = UnixStream::connect(path).await.unwrap();
        raw.write_all(b"{\"type\":\"payload\",\"body\":\"x\"}\n")
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("loop should end")
            .unwrap();
        assert!(matches!(result, Err(FactoryError::Handshake(_))));
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_ends_loop() {
        let harness = start(Duration::from_millis(30)).await;
        let _silent = harness.endpoint.connect().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), harness.task)
            .await
            .expect("loop should end")
            .unwrap();
        assert!(matches!(result, Err(FactoryError::Handshake(msg)) if msg.contains("no pid frame")));
    }

    #[tokio::test]
    async fn test_run_reports_failure_once() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::unix(dir.path().join("relay.sock"));
        let listener = RelayListener::bind(&endpoint).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);

        let task = tokio::spawn(run(
            listener,
            Arc::new(PidRegistry::new()),
            Duration::from_secs(1),
            CancellationToken::new(),
            tx,
        ));

        let worker = endpoint.connect().await.unwrap();
        worker.send(&Frame::Ping).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .expect("terminal error should be reported");
        assert!(matches!(err, FactoryError::Handshake(_)));

        task.await.unwrap();
        assert!(rx.recv().await.is_none(), "only one error is reported");
    }

    #[tokio::test]
    async fn test_run_shutdown_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let listener = RelayListener::bind(&Endpoint::unix(dir.path().join("relay.sock")))
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(
            listener,
            Arc::new(PidRegistry::new()),
            Duration::from_secs(1),
            shutdown.clone(),
            tx,
        ));
        shutdown.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
