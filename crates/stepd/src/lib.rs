//! stepd - pipeline step execution daemon
//!
//! Library components for the daemon process: the step executor, the output
//! plumbing around it, and the HTTP surface.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod livelog;
pub mod log_client;
pub mod replacer;
pub mod scope;
pub mod server;
pub mod step_log;

use std::sync::Arc;

use step_core::{Config, LogConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use dispatcher::Dispatcher;
use engine::{Engine, ProcessEngine};
use executor::{ExecutorOptions, StepExecutor};
use log_client::{HttpLogClient, LogClient, NoopLogClient};
use server::AppState;

/// Log client for `config`: HTTP when a service URL is set, otherwise no-op.
pub fn build_log_client(config: &Config) -> Arc<dyn LogClient> {
    match &config.log_service_url {
        Some(url) => Arc::new(HttpLogClient::new(
            url,
            &config.account_id,
            config.log_service_token.as_deref(),
        )),
        None => Arc::new(NoopLogClient),
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    executor: Arc<StepExecutor>,
    log_client: Arc<dyn LogClient>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a daemon running steps as local processes.
    pub fn new(config: Config) -> Self {
        let engine: Arc<dyn Engine> = Arc::new(ProcessEngine::new());
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: Config, engine: Arc<dyn Engine>) -> Self {
        let dispatcher = Dispatcher::new(engine, config.work_dir.clone());
        let executor = StepExecutor::new(dispatcher).with_options(ExecutorOptions {
            log_flush_interval: config.log_flush_interval(),
            ..Default::default()
        });
        let log_client = build_log_client(&config);

        Self {
            config,
            executor: Arc::new(executor),
            log_client,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    /// Shared state for the HTTP handlers.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            executor: Arc::clone(&self.executor),
            log_client: Arc::clone(&self.log_client),
            log_config: LogConfig {
                trim_newline_suffix: self.config.trim_newline_suffix,
            },
            auth_token: self.config.auth_token.clone(),
        })
    }

    /// Serve the HTTP API until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("stepd starting on {}:{}", self.config.bind_host, self.config.port);
        info!("work dir: {}", self.config.work_dir.display());
        match &self.config.log_service_url {
            Some(url) => info!("log service: {}", url),
            None => info!("log service: disabled"),
        }
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        server::start_server(
            self.app_state(),
            &self.config.bind_host,
            self.config.port,
            self.shutdown.clone(),
        )
        .await
    }

    /// Stop serving and cancel in-flight steps.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
        self.executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_client_follows_config() {
        let config = Config::default();
        let client = build_log_client(&config);
        assert!(format!("{client:?}").contains("NoopLogClient"));

        let config = Config {
            log_service_url: Some("http://logs.local".to_string()),
            ..Default::default()
        };
        let client = build_log_client(&config);
        assert!(format!("{client:?}").contains("HttpLogClient"));
    }

    #[tokio::test]
    async fn shutdown_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            port: 0,
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let daemon = Arc::new(Daemon::new(config));

        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await.map_err(|e| e.to_string()) });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        daemon.shutdown();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
