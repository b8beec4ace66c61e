// ABOUTME: Relay endpoint addresses and the listening socket bound to them.
// ABOUTME: Supports unix://<path> and tcp://<host>:<port>, for both the host and worker side.

use crate::error::{FactoryError, Result};
use crate::relay::Relay;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Address of the socket the factory listens on and workers connect back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`, resolved when binding or connecting.
    Tcp(String),
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    /// Connect to this endpoint from the worker side.
    pub async fn connect(&self) -> Result<Relay> {
        match self {
            Endpoint::Unix(path) => Ok(Relay::new(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Relay::new(stream))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FactoryError::InvalidEndpoint(s.to_string());
        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }

        match scheme {
            "unix" => Ok(Endpoint::Unix(PathBuf::from(rest))),
            "tcp" => {
                // Needs a port; the host part may be empty (":6001") or bracketed IPv6.
                let (_, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Endpoint::Tcp(rest.to_string()))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// A bound listening socket accepting relay connections.
///
/// A unix listener removes its socket file when dropped.
pub enum RelayListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl RelayListener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let bind_err = |source| FactoryError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Unix(path) => {
                // A stale socket from a previous run would make bind fail with AddrInUse.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(RelayListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_err)?;
                Ok(RelayListener::Tcp(listener))
            }
        }
    }

    /// The endpoint workers should connect to. For TCP this reports the bound port,
    /// so binding `tcp://127.0.0.1:0` yields a usable address.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            RelayListener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            RelayListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }

    /// Accept the next connection and wrap it as a relay.
    pub async fn accept(&self) -> std::io::Result<Relay> {
        match self {
            RelayListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Relay::new(stream))
            }
            RelayListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::trace!(%peer, "Accepted tcp relay connection");
                Ok(Relay::new(stream))
            }
        }
    }

    fn socket_path(&self) -> Option<&Path> {
        match self {
            RelayListener::Unix { path, .. } => Some(path),
            RelayListener::Tcp(_) => None,
        }
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}
