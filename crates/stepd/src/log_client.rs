//! Client for the remote log service.
//!
//! The remote sink talks to the service through the [`LogClient`] trait so the
//! executor can be driven without a network. [`HttpLogClient`] speaks the
//! service's HTTP API; [`NoopLogClient`] discards everything.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use step_core::LogLine;
use thiserror::Error;
use tracing::debug;

/// Header carrying the service token.
const TOKEN_HEADER: &str = "X-Harness-Token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogClientError {
    #[error("log service request failed: {0}")]
    Request(String),
    #[error("log service returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl From<reqwest::Error> for LogClientError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => LogClientError::Status {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => LogClientError::Request(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LogClientError>;

#[async_trait]
pub trait LogClient: Send + Sync + std::fmt::Debug {
    /// Open a live stream under `key`.
    async fn open(&self, key: &str) -> Result<()>;
    /// Append lines to an open stream.
    async fn write(&self, key: &str, lines: &[LogLine]) -> Result<()>;
    /// Store the complete log for `key`.
    async fn upload(&self, key: &str, lines: &[LogLine]) -> Result<()>;
    /// Close the live stream.
    async fn close(&self, key: &str) -> Result<()>;
}

/// Log client for deployments without a log service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogClient;

#[async_trait]
impl LogClient for NoopLogClient {
    async fn open(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn write(&self, _key: &str, _lines: &[LogLine]) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, _key: &str, _lines: &[LogLine]) -> Result<()> {
        Ok(())
    }

    async fn close(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// HTTP client for the log service.
#[derive(Debug, Clone)]
pub struct HttpLogClient {
    base_url: String,
    account_id: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpLogClient {
    pub fn new(base_url: &str, account_id: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            token: token.map(ToString::to_string),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(token) {
                headers.insert(TOKEN_HEADER, value);
            }
        }
        headers
    }

    fn request(&self, method: reqwest::Method, path: &str, key: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{path}", self.base_url);
        self.http
            .request(method, url)
            .headers(self.headers())
            .query(&[("accountID", self.account_id.as_str()), ("key", key)])
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<()> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(LogClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl LogClient for HttpLogClient {
    async fn open(&self, key: &str) -> Result<()> {
        debug!(key, "opening log stream");
        self.send(self.request(reqwest::Method::POST, "stream", key))
            .await
    }

    async fn write(&self, key: &str, lines: &[LogLine]) -> Result<()> {
        self.send(self.request(reqwest::Method::PUT, "stream", key).json(lines))
            .await
    }

    async fn upload(&self, key: &str, lines: &[LogLine]) -> Result<()> {
        debug!(key, lines = lines.len(), "uploading log blob");
        self.send(self.request(reqwest::Method::POST, "blob", key).json(lines))
            .await
    }

    async fn close(&self, key: &str) -> Result<()> {
        debug!(key, "closing log stream");
        self.send(self.request(reqwest::Method::DELETE, "stream", key))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// One call observed by [`RecordingLogClient`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open(String),
        Write(String, Vec<LogLine>),
        Upload(String, Vec<LogLine>),
        Close(String),
    }

    /// In-memory log client that records calls and can be told to fail.
    #[derive(Debug, Default)]
    pub struct RecordingLogClient {
        pub calls: Mutex<Vec<Call>>,
        pub fail_open: bool,
        pub fail_write: bool,
        pub fail_upload: bool,
        pub fail_close: bool,
    }

    impl RecordingLogClient {
        pub fn calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Messages of every line written or uploaded, in call order.
        pub fn written(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Write(_, lines) => Some(lines),
                    _ => None,
                })
                .flatten()
                .map(|line| line.message)
                .collect()
        }

        pub fn uploaded(&self) -> Option<Vec<String>> {
            self.calls().into_iter().find_map(|call| match call {
                Call::Upload(_, lines) => Some(lines.into_iter().map(|l| l.message).collect()),
                _ => None,
            })
        }

        fn record(&self, call: Call, fail: bool, what: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
            if fail {
                Err(LogClientError::Request(format!("{what} failed")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LogClient for RecordingLogClient {
        async fn open(&self, key: &str) -> Result<()> {
            self.record(Call::Open(key.to_string()), self.fail_open, "open")
        }

        async fn write(&self, key: &str, lines: &[LogLine]) -> Result<()> {
            self.record(
                Call::Write(key.to_string(), lines.to_vec()),
                self.fail_write,
                "write",
            )
        }

        async fn upload(&self, key: &str, lines: &[LogLine]) -> Result<()> {
            self.record(
                Call::Upload(key.to_string(), lines.to_vec()),
                self.fail_upload,
                "upload",
            )
        }

        async fn close(&self, key: &str) -> Result<()> {
            self.record(Call::Close(key.to_string()), self.fail_close, "close")
        }
    }
}
