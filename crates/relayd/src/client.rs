// ABOUTME: Worker side of the relay protocol, run by `relayd worker`.
// ABOUTME: Connects back to the host, announces its PID, then echoes payloads until told to stop.

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::relay::{Frame, Relay};

/// Connect to the host and complete the handshake as process `pid`.
pub async fn connect(endpoint: &Endpoint, pid: i64) -> Result<Relay> {
    let relay = endpoint.connect().await?;
    relay.announce_pid(pid).await?;
    tracing::debug!(%endpoint, pid, "Relay connected");
    Ok(relay)
}

/// Serve frames from the host until it sends `Stop` or hangs up.
///
/// Payloads are echoed back unchanged and pings are answered with `pid`.
pub async fn serve(relay: &Relay, pid: i64) -> Result<()> {
    while let Some(frame) = relay.receive().await? {
        match frame {
            Frame::Payload { body } => relay.send(&Frame::Payload { body }).await?,
            Frame::Ping => relay.send(&Frame::Pid { pid }).await?,
            Frame::Stop => {
                tracing::info!(pid, "Stop requested");
                return Ok(());
            }
            Frame::Pid { pid: other } => {
                tracing::warn!(pid, other, "Ignoring unexpected pid frame from host");
            }
        }
    }

    tracing::info!(pid, "Host closed the relay");
    Ok(())
}
