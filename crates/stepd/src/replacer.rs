//! Secret redaction in front of a log stream.

use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::OutputSink;
use crate::livelog::{LogStream, LogStreamError};

/// Text written in place of a secret.
pub const MASK: &str = "**************";

/// Masks secrets before forwarding output to the wrapped stream and, when
/// set, to a local mirror.
#[derive(Debug)]
pub struct Replacer {
    inner: Arc<dyn LogStream>,
    mirror: Option<Arc<dyn OutputSink>>,
    /// Non-empty secret fragments, longest first.
    secrets: Vec<Vec<u8>>,
}

impl Replacer {
    pub fn new(inner: Arc<dyn LogStream>, secrets: &[String]) -> Self {
        let mut fragments: Vec<String> = secrets
            .iter()
            .flat_map(|secret| secret.lines())
            .map(str::trim)
            .filter(|fragment| !fragment.is_empty())
            .map(ToString::to_string)
            .collect();
        // Longer fragments first so a secret containing another is masked whole.
        fragments.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        fragments.dedup();

        Self {
            inner,
            mirror: None,
            secrets: fragments.into_iter().map(String::into_bytes).collect(),
        }
    }

    /// Also deliver redacted output to `mirror`.
    pub fn with_mirror(mut self, mirror: Arc<dyn OutputSink>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Copy of `chunk` with every secret replaced by [`MASK`]. Bytes outside
    /// secrets are passed through untouched, valid UTF-8 or not.
    pub fn redact(&self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        let mut rest = chunk;
        while let Some(&first) = rest.first() {
            match self.secrets.iter().find(|secret| rest.starts_with(secret.as_slice())) {
                Some(secret) => {
                    out.extend_from_slice(MASK.as_bytes());
                    rest = &rest[secret.len()..];
                }
                None => {
                    out.push(first);
                    rest = &rest[1..];
                }
            }
        }
        out
    }
}

impl OutputSink for Replacer {
    fn write(&self, chunk: &[u8]) {
        if self.secrets.is_empty() {
            self.inner.write(chunk);
            if let Some(mirror) = &self.mirror {
                mirror.write(chunk);
            }
            return;
        }

        let redacted = self.redact(chunk);
        self.inner.write(&redacted);
        if let Some(mirror) = &self.mirror {
            mirror.write(&redacted);
        }
    }
}

#[async_trait]
impl LogStream for Replacer {
    async fn open(&self) -> Result<(), LogStreamError> {
        self.inner.open().await
    }

    async fn close(&self) -> Result<(), LogStreamError> {
        self.inner.close().await
    }

    fn error(&self) -> Option<LogStreamError> {
        self.inner.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::CaptureSink;
    use crate::livelog::Livelog;
    use crate::log_client::testing::RecordingLogClient;
    use crate::log_client::LogClient;
    use step_core::LogConfig;

    fn stream(client: &Arc<RecordingLogClient>) -> Arc<dyn LogStream> {
        let client: Arc<dyn LogClient> = client.clone();
        Arc::new(Livelog::new(
            client,
            "key",
            LogConfig {
                trim_newline_suffix: true,
            },
        ))
    }

    fn replacer(secrets: &[&str]) -> Replacer {
        let client = Arc::new(RecordingLogClient::default());
        let secrets: Vec<String> = secrets.iter().map(ToString::to_string).collect();
        Replacer::new(stream(&client), &secrets)
    }

    #[test]
    fn masks_every_occurrence() {
        let r = replacer(&["hunter2"]);
        assert_eq!(
            r.redact(b"password=hunter2 again hunter2"),
            format!("password={MASK} again {MASK}").into_bytes()
        );
    }

    #[test]
    fn masks_each_line_of_multiline_secret() {
        let r = replacer(&["line-one\nline-two"]);
        assert_eq!(
            r.redact(b"got line-two then line-one"),
            format!("got {MASK} then {MASK}").into_bytes()
        );
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let r = replacer(&["", "   "]);
        assert_eq!(r.redact(b"nothing to hide"), b"nothing to hide");
    }

    #[test]
    fn longer_secret_wins_over_contained_one() {
        let r = replacer(&["abc", "abcdef"]);
        assert_eq!(r.redact(b"xabcdefx"), format!("x{MASK}x").into_bytes());
    }

    #[tokio::test]
    async fn redacts_before_remote_and_mirror() {
        let client = Arc::new(RecordingLogClient::default());
        let mirror = Arc::new(CaptureSink::default());
        let r = Replacer::new(stream(&client), &["s3cr3t".to_string()])
            .with_mirror(mirror.clone());

        r.open().await.unwrap();
        r.write(b"token is s3cr3t\n");
        r.close().await.unwrap();

        assert_eq!(client.uploaded().unwrap(), vec![format!("token is {MASK}")]);
        assert_eq!(mirror.contents(), format!("token is {MASK}\n"));
        assert!(r.error().is_none());
    }

    #[test]
    fn non_utf8_bytes_pass_through_unchanged() {
        let mirror = Arc::new(CaptureSink::default());
        let r = replacer(&["s3cr3t"]).with_mirror(mirror.clone());

        r.write(&[255, 254, b'o', b'k', b'\n']);
        r.write(b"\xffs3cr3t\xfe\n");

        let mut expected = vec![255, 254, b'o', b'k', b'\n', 255];
        expected.extend_from_slice(MASK.as_bytes());
        expected.extend_from_slice(&[254, b'\n']);
        assert_eq!(mirror.bytes(), expected);
    }

    #[tokio::test]
    async fn close_error_is_visible_through_wrapper() {
        let client = Arc::new(RecordingLogClient {
            fail_close: true,
            ..Default::default()
        });
        let r = Replacer::new(stream(&client), &[]);
        r.open().await.unwrap();
        assert!(matches!(r.close().await, Err(LogStreamError::Close(_))));
        assert!(matches!(r.error(), Some(LogStreamError::Close(_))));
    }
}
