//! stepd - pipeline step execution daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use step_core::Config;
use stepd::Daemon;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "stepd", about = "Pipeline step execution daemon", version)]
struct Cli {
    /// Env file with `key=value` settings
    #[arg(long, env = "STEPD_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind_host: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable trace logging
    #[arg(long)]
    trace: bool,
}

fn load_config(cli: &Cli) -> Result<Config, step_core::config::ConfigError> {
    let mut config = Config::default();
    if let Some(path) = &cli.env_file {
        config.load_file(path)?;
    }
    config.apply_env()?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind_host) = &cli.bind_host {
        config.bind_host.clone_from(bind_host);
    }
    config.debug |= cli.debug;
    config.trace |= cli.trace;
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing.
    let default_level = if config.trace {
        "trace"
    } else if config.debug {
        "debug"
    } else {
        "info"
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Run the async main.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = Daemon::new(config);
        let daemon_ref = &daemon;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                        std::process::exit(1);
                    }
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                        std::process::exit(1);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                    daemon_ref.shutdown();
                }
            }
        }
    });
}
