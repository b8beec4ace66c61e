// ABOUTME: relayd library: socket worker factory, PID registry, relay protocol, and host runtime.
// ABOUTME: Re-exports for programmatic use of the factory without the CLI.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod host;
pub mod init;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod worker;

pub use config::{Config, FactoryConfig, PoolConfig, RELAY_ENV};
pub use endpoint::{Endpoint, RelayListener};
pub use error::{FactoryError, MultiError, Result};
pub use factory::Factory;
pub use host::{run_serve, run_worker, ServeOptions, WorkerOptions};
pub use init::run_init;
pub use registry::PidRegistry;
pub use relay::{Connection, Frame, Relay};
pub use worker::{ProcessSpec, Worker, WorkerState};

// Re-export so callers can build cancellation tokens for `Factory::spawn_with_cancel`.
pub use tokio_util::sync::CancellationToken;
