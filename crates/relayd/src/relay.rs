// ABOUTME: Duplex relay between the host and one worker process.
// ABOUTME: Newline-delimited JSON frames over any async stream, plus the PID handshake.

use crate::error::{FactoryError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;

/// Any byte stream a relay can run over (unix socket, TCP socket, in-memory duplex).
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedConnection = Box<dyn Connection>;

/// A single relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Process identity. The first frame a worker sends, and its answer to `Ping`.
    Pid { pid: i64 },
    /// Liveness probe from the host.
    Ping,
    /// Ask the worker to exit gracefully.
    Stop,
    /// Opaque application data.
    Payload { body: String },
}

/// Cheaply cloneable handle to one relay connection.
///
/// Reads and writes are serialized independently, so one task can wait on `receive`
/// while another sends.
#[derive(Clone)]
pub struct Relay {
    reader: Arc<Mutex<BufReader<ReadHalf<BoxedConnection>>>>,
    writer: Arc<Mutex<WriteHalf<BoxedConnection>>>,
}

impl Relay {
    pub fn new<C: Connection>(conn: C) -> Self {
        let boxed: BoxedConnection = Box::new(conn);
        let (reader, writer) = tokio::io::split(boxed);
        Self {
            reader: Arc::new(Mutex::new(BufReader::new(reader))),
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let line = serde_json::to_string(frame)? + "\n";
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame. `Ok(None)` means the peer closed the connection.
    pub async fn receive(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(serde_json::from_str(trimmed)?));
            }
        }
    }

    /// Host side of the handshake: read the worker's PID from its first frame.
    pub async fn fetch_pid(&self, timeout: Duration) -> Result<i64> {
        let first = tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| {
                FactoryError::Handshake(format!("no pid frame received within {timeout:?}"))
            })?
            .map_err(|e| FactoryError::Handshake(e.to_string()))?;

        match first {
            Some(Frame::Pid { pid }) if pid > 0 => Ok(pid),
            Some(Frame::Pid { pid }) => Err(FactoryError::Handshake(format!(
                "invalid pid {pid} in handshake"
            ))),
            Some(other) => Err(FactoryError::Handshake(format!(
                "expected pid frame, got {other:?}"
            ))),
            None => Err(FactoryError::Handshake(
                "connection closed before handshake".to_string(),
            )),
        }
    }

    /// Worker side of the handshake.
    pub async fn announce_pid(&self, pid: i64) -> Result<()> {
        self.send(&Frame::Pid { pid }).await
    }

    /// Round-trip a ping and return the PID the worker reports.
    pub async fn ping(&self, timeout: Duration) -> Result<i64> {
        self.send(&Frame::Ping).await?;
        let reply = tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| {
                FactoryError::RelayIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "ping timed out",
                ))
            })??;
        match reply {
            Some(Frame::Pid { pid }) => Ok(pid),
            Some(other) => Err(FactoryError::RelayIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected ping reply {other:?}"),
            ))),
            None => Err(FactoryError::RelayIo(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}
