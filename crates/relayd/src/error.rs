// ABOUTME: Error types for the relayd factory.
// ABOUTME: FactoryError covers launch, relay wait, listener and lifecycle failures; MultiError aggregates them.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FactoryError>;

/// Errors that can occur while spawning workers or running the relay listener.
#[derive(Error, Debug)]
pub enum FactoryError {
    /// The relay address could not be parsed.
    #[error("invalid relay endpoint '{0}': expected unix://<path> or tcp://<host>:<port>")]
    InvalidEndpoint(String),

    /// Binding the listening socket failed.
    #[error("failed to bind relay endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to start the worker process.
    #[error("failed to start worker process '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation needed a running process but the worker was never started.
    #[error("worker process has not been started")]
    NotStarted,

    /// No relay connection appeared for the process within the configured timeout.
    #[error("relay timeout: worker pid {pid} did not connect within {timeout:?}")]
    RelayTimeout { pid: i64, timeout: Duration },

    /// The process exited before its relay could be attached.
    #[error("worker pid {pid} exited during spawn: {status}")]
    ExitedEarly { pid: i64, status: String },

    /// The caller cancelled the spawn while it was waiting for the relay.
    #[error("spawn cancelled")]
    Cancelled,

    /// The factory was closed before or during the operation.
    #[error("factory is closed")]
    Closed,

    /// Killing the worker process failed.
    #[error("failed to kill worker pid {pid}: {source}")]
    Kill {
        pid: i64,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the worker process to exit failed.
    #[error("failed to wait for worker pid {pid}: {source}")]
    Wait {
        pid: i64,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a relay connection failed. Terminal for the listener.
    #[error("relay accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A connected peer did not complete the PID handshake. Terminal for the listener.
    #[error("relay handshake failed: {0}")]
    Handshake(String),

    /// Reading or writing a relay frame failed.
    #[error("relay i/o error: {0}")]
    RelayIo(#[from] std::io::Error),

    /// A relay frame could not be encoded or decoded.
    #[error("relay protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The background spawn task went away without reporting a result.
    #[error("spawn task failed: {0}")]
    SpawnTask(String),

    /// Several failures from one operation, none of them dropped.
    #[error(transparent)]
    Multiple(MultiError),
}

impl FactoryError {
    /// Underlying causes of this error. A single error yields itself.
    pub fn causes(&self) -> Vec<&FactoryError> {
        match self {
            FactoryError::Multiple(multi) => multi.errors().iter().collect(),
            other => vec![other],
        }
    }

    /// Whether this error (or any aggregated cause) is a relay timeout.
    pub fn is_relay_timeout(&self) -> bool {
        self.causes()
            .iter()
            .any(|e| matches!(e, FactoryError::RelayTimeout { .. }))
    }
}

/// An ordered collection of errors from one operation.
///
/// Built with [`MultiError::combine`], which keeps every failure and collapses to the
/// bare error when only one occurred.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<FactoryError>,
}

impl MultiError {
    /// Combine the failures among `results`. Returns `None` when every result is `Ok`.
    pub fn combine<I>(results: I) -> Option<FactoryError>
    where
        I: IntoIterator<Item = Result<()>>,
    {
        let mut multi = MultiError::default();
        multi.extend(results);
        if multi.errors.is_empty() {
            None
        } else {
            Some(multi.into_error())
        }
    }

    /// Aggregate `cause` with any failures among `rest`. `cause` comes first.
    pub fn aggregate<I>(cause: FactoryError, rest: I) -> FactoryError
    where
        I: IntoIterator<Item = Result<()>>,
    {
        let mut multi = MultiError::default();
        multi.push(cause);
        multi.extend(rest);
        multi.into_error()
    }

    pub fn push(&mut self, err: FactoryError) {
        match err {
            FactoryError::Multiple(nested) => self.errors.extend(nested.errors),
            err => self.errors.push(err),
        }
    }

    fn extend<I>(&mut self, results: I)
    where
        I: IntoIterator<Item = Result<()>>,
    {
        for err in results.into_iter().filter_map(|r| r.err()) {
            self.push(err);
        }
    }

    /// Collapse into a single error. Must hold at least one error.
    fn into_error(mut self) -> FactoryError {
        if self.errors.len() == 1 {
            self.errors.swap_remove(0)
        } else {
            FactoryError::Multiple(self)
        }
    }

    pub fn errors(&self) -> &[FactoryError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FactoryError> {
        self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
