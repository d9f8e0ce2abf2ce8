//! Error types for sessions, steps, workflows and the fan-out executor.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport or protocol failure reported by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The remote side answered with an unexpected status.
    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },

    /// The address could not be used.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// I/O failure while talking to the remote side.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The FGP daemon rejected or failed the call.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// The response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The session was used after `close()`.
    #[error("session closed")]
    Closed,
}

/// Failure recorded on a step after it ran.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step ran but could not produce a valid output.
    #[error("{0}")]
    Failed(String),

    /// The session failed underneath the step.
    #[error("session failure: {0}")]
    Session(#[from] SessionError),

    /// A login step could not establish an authenticated state.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The remote system demands an out-of-band verification.
    #[error("identity confirmation required: {0}")]
    IdentityConfirmationRequired(String),

    /// A fan-out task failed, aborting the aggregate.
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] Box<FanOutError<StepError>>),

    /// A URL or form field template could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    /// The step was executed without an input.
    #[error("no input was provided")]
    MissingInput,
}

impl StepError {
    /// Create a step failure from any displayable message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<FanOutError<StepError>> for StepError {
    fn from(err: FanOutError<StepError>) -> Self {
        Self::Aggregation(Box::new(err))
    }
}

/// Programming or configuration error in how stages are wired together.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("step `{step}` expects input of type {expected}, got {found}")]
    InputType {
        step: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("step `{step}` was already executed")]
    AlreadyExecuted { step: String },

    #[error("step `{step}` has no output")]
    MissingOutput { step: String },

    #[error("could not snapshot login step `{step}`: {message}")]
    Snapshot { step: String, message: String },

    #[error("workflow yields {found}, caller expected {expected}")]
    OutputType {
        expected: &'static str,
        found: &'static str,
    },
}

/// The single terminal error of a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Any step failure other than the credential kinds below. The failing
    /// step's error is kept as the source.
    #[error("communication problem in step `{step}`")]
    Communication {
        step: String,
        #[source]
        source: Arc<StepError>,
    },

    #[error("invalid credentials rejected by step `{step}`: {message}")]
    InvalidCredentials { step: String, message: String },

    #[error("identity confirmation required by step `{step}`: {message}")]
    IdentityConfirmationRequired { step: String, message: String },

    /// The session could not be acquired.
    #[error("could not open session: {0}")]
    Session(#[from] SessionError),

    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// Two consecutive stages do not fit together.
    #[error(
        "stage {index} (`{step}`) expects {expected} but the previous stage produces {found}"
    )]
    Incompatible {
        index: usize,
        step: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("workflow has no steps")]
    Empty,

    #[error("workflow was already executed")]
    AlreadyExecuted,
}

impl WorkflowError {
    /// Translate a step failure into the workflow-level error kind.
    ///
    /// Credential failures keep their own kinds, also when they come back
    /// from a fan-out worker.
    pub(crate) fn from_step(step: &str, err: impl Into<Arc<StepError>>) -> Self {
        let err = err.into();
        match credential_failure(&err) {
            Some(StepError::InvalidCredentials(message)) => Self::InvalidCredentials {
                step: step.to_string(),
                message: message.clone(),
            },
            Some(StepError::IdentityConfirmationRequired(message)) => {
                Self::IdentityConfirmationRequired {
                    step: step.to_string(),
                    message: message.clone(),
                }
            }
            _ => Self::Communication {
                step: step.to_string(),
                source: err,
            },
        }
    }

    /// Whether re-running with the same input could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Session(_))
    }
}

/// The credential failure behind `err`, looking through aggregation.
fn credential_failure(err: &StepError) -> Option<&StepError> {
    match err {
        StepError::InvalidCredentials(_) | StepError::IdentityConfirmationRequired(_) => Some(err),
        StepError::Aggregation(inner) => match inner.as_ref() {
            FanOutError::Task { source, .. } => credential_failure(source),
            _ => None,
        },
        _ => None,
    }
}

/// Failure of a fan-out aggregation.
#[derive(Debug, Error)]
pub enum FanOutError<E> {
    /// A task returned an error.
    #[error("task {index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: E,
    },

    #[error("task {index} panicked")]
    Panicked { index: usize },

    /// All-or-nothing policy and at least one task missed the deadline.
    #[error("{pending} task(s) did not finish within {waited:?}")]
    Timeout { pending: usize, waited: Duration },

    #[error("could not build worker pool: {0}")]
    Pool(String),
}

/// Invalid Sequence Matcher definition.
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("part `{key}` needs exactly 3 capture groups, found {found}")]
    GroupCount { key: String, found: usize },

    #[error("pattern `{pattern}` has no `{group}` group")]
    MissingGroup { pattern: String, group: String },
}

/// Invalid step definition in a workflow description.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown step kind: {0}")]
    UnknownKind(String),

    #[error("invalid params for step {index} ({kind}): {source}")]
    Params {
        index: usize,
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid pattern in step {index}: {source}")]
    Matcher {
        index: usize,
        #[source]
        source: MatcherError,
    },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}
