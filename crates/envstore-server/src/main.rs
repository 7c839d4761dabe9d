use clap::Parser;
use envstore_server::{ConfigOverrides, ServerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "envstore-server", about = "Environment and build record store")]
struct Cli {
    /// TOML config file.
    #[arg(long, env = "ENVSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, env = "ENVSTORE_LISTEN")]
    listen: Option<String>,

    /// `memory` or a postgres:// URL.
    #[arg(long, env = "ENVSTORE_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "ENVSTORE_MAX_CONNECTIONS")]
    max_connections: Option<u32>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "ENVSTORE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Postgres isolation level: serializable or read_committed.
    #[arg(long, env = "ENVSTORE_ISOLATION")]
    isolation: Option<String>,
}

fn load_config(cli: Cli) -> Result<ServerConfig, envstore_server::ConfigError> {
    let mut config = ServerConfig::load_or_default(cli.config.as_deref())?;
    config.apply(ConfigOverrides {
        listen: cli.listen,
        database_url: cli.database_url,
        max_connections: cli.max_connections,
        log_level: cli.log_level,
        isolation: cli.isolation,
    })?;
    Ok(config)
}

fn main() -> ExitCode {
    let config = match load_config(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("envstore-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("starting envstore-server on {}", config.listen);
    match envstore_server::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
