//! Step-level errors and multi-cause aggregation.

use thiserror::Error;

use crate::livelog::LogStreamError;

/// Error recorded against a step and delivered to pollers as data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The run scope was canceled before the step finished.
    #[error("context canceled")]
    Canceled,
    /// The step ran past its configured timeout.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("{0}")]
    Engine(String),
    #[error(transparent)]
    LogStream(#[from] LogStreamError),
    #[error("oom killed")]
    OomKilled,
    #[error("exit status {0}")]
    ExitStatus(i32),
    /// Several causes reported together; never nested.
    #[error("{}", format_causes(.0))]
    Multiple(Vec<StepError>),
}

impl StepError {
    /// Combine an optional existing error with a new cause, keeping both.
    pub fn append(existing: Option<StepError>, err: StepError) -> StepError {
        let Some(existing) = existing else {
            return err;
        };

        let mut causes = existing.into_causes();
        causes.extend(err.into_causes());
        StepError::Multiple(causes)
    }

    /// Flattened list of individual causes.
    pub fn causes(&self) -> Vec<&StepError> {
        match self {
            StepError::Multiple(errs) => errs.iter().collect(),
            other => vec![other],
        }
    }

    /// True if any cause equals `err`.
    pub fn contains(&self, err: &StepError) -> bool {
        self.causes().into_iter().any(|cause| cause == err)
    }

    fn into_causes(self) -> Vec<StepError> {
        match self {
            StepError::Multiple(errs) => errs,
            other => vec![other],
        }
    }
}

fn format_causes(causes: &[StepError]) -> String {
    match causes {
        [] => "no errors".to_string(),
        [single] => single.to_string(),
        many => {
            let joined = many
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            format!("{} errors occurred: {joined}", many.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_to_none_returns_the_error() {
        let err = StepError::append(None, StepError::ExitStatus(2));
        assert_eq!(err, StepError::ExitStatus(2));
        assert_eq!(err.to_string(), "exit status 2");
    }

    #[test]
    fn append_keeps_every_cause_flat() {
        let first = StepError::append(None, StepError::Engine("engine down".to_string()));
        let second = StepError::append(Some(first), StepError::ExitStatus(1));
        let third = StepError::append(
            Some(second),
            StepError::Multiple(vec![StepError::OomKilled]),
        );

        assert_eq!(third.causes().len(), 3);
        assert!(third.contains(&StepError::OomKilled));
        assert_eq!(
            third.to_string(),
            "3 errors occurred: engine down; exit status 1; oom killed"
        );
    }

    #[test]
    fn cancellation_variants() {
        assert_eq!(StepError::Canceled.to_string(), "context canceled");
        assert_eq!(
            StepError::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }
}
