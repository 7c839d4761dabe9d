//! Request/reply server for envstore.
//!
//! [`router`] maps subjects to engine operations, [`http`] exposes them over
//! a tiny_http bridge, and [`run`] wires a configured backend, the bridge and
//! the shutdown flag together for the `envstore-server` binary.

pub mod config;
pub mod http;
pub mod router;
pub mod signal;

pub use config::{Backend, ConfigError, ConfigOverrides, ServerConfig};
pub use http::TestServer;
pub use router::{dispatch, Reply, Subject};

use envstore_core::Engine;
use envstore_store::{MemoryStore, Store, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tiny_http::Server;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("failed to start runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serve `config` until a shutdown is requested.
pub fn run(config: &ServerConfig) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;
    signal::install_signal_handler();
    let server = http::bind(&config.listen)?;

    match config.backend()? {
        Backend::Memory => {
            warn!("using the in-memory store; records are lost on exit");
            serve(&runtime, &server, MemoryStore::new());
            Ok(())
        }
        #[cfg(feature = "postgres")]
        Backend::Postgres(url) => {
            use envstore_store::{IsolationLevel, PgStore};

            let isolation: IsolationLevel = config.isolation.parse()?;
            let store = runtime
                .block_on(PgStore::connect(&url, config.max_connections))?
                .with_isolation(isolation);
            runtime.block_on(store.ensure_schema())?;
            info!("postgres schema ready, transactions run {isolation}");
            serve(&runtime, &server, store);
            Ok(())
        }
        #[cfg(not(feature = "postgres"))]
        Backend::Postgres(_) => Err(ServerError::Config(ConfigError::Invalid(
            "this build has no postgres support".to_owned(),
        ))),
    }
}

fn serve<S: Store>(runtime: &Runtime, server: &Server, store: S) {
    let engine = Arc::new(Engine::new(store));
    http::run_server(&engine, runtime.handle(), server, signal::shutdown_requested);
    runtime.block_on(engine.close());
    info!("store closed");
}
