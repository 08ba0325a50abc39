//! Cancellation scope for a single step run.
//!
//! Wraps a [`CancellationToken`] with an optional deadline and records which
//! of the two ended the scope, so callers can tell a timeout from an explicit
//! cancel. Dropping the scope cancels it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;

#[derive(Debug)]
pub struct RunScope {
    token: CancellationToken,
    deadline_exceeded: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl RunScope {
    /// Create a scope that is a child of `parent` and, if `timeout` is set,
    /// cancels itself when the timeout elapses.
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let deadline_exceeded = Arc::new(AtomicBool::new(false));

        let timer = timeout.map(|timeout| {
            let token = token.clone();
            let flag = Arc::clone(&deadline_exceeded);
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        // Flag first so `err` never observes a bare cancel.
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            })
        });

        Self {
            token,
            deadline_exceeded,
            timer,
        }
    }

    /// Token observed by everything running inside the scope.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Why the scope ended, or `None` while it is still live.
    pub fn err(&self) -> Option<StepError> {
        if !self.token.is_cancelled() {
            return None;
        }
        if self.deadline_exceeded.load(Ordering::SeqCst) {
            Some(StepError::DeadlineExceeded)
        } else {
            Some(StepError::Canceled)
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_scope_has_no_error() {
        let root = CancellationToken::new();
        let scope = RunScope::new(&root, None);
        assert!(scope.err().is_none());
    }

    #[tokio::test]
    async fn timeout_reports_deadline_exceeded() {
        let root = CancellationToken::new();
        let scope = RunScope::new(&root, Some(Duration::from_millis(20)));
        scope.token().cancelled().await;
        assert_eq!(scope.err(), Some(StepError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn explicit_cancel_reports_canceled() {
        let root = CancellationToken::new();
        let scope = RunScope::new(&root, Some(Duration::from_secs(60)));
        scope.token().cancel();
        assert_eq!(scope.err(), Some(StepError::Canceled));
    }

    #[tokio::test]
    async fn parent_cancel_propagates() {
        let root = CancellationToken::new();
        let scope = RunScope::new(&root, None);
        root.cancel();
        assert_eq!(scope.err(), Some(StepError::Canceled));
    }

    #[tokio::test]
    async fn drop_cancels_token() {
        let root = CancellationToken::new();
        let scope = RunScope::new(&root, None);
        let token = scope.token();
        drop(scope);
        assert!(token.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
