//! The step contract.
//!
//! A [`Step`] does the work; a [`StepCell`] wraps it with the single-use
//! state machine (input slot, output slot, failure) and erases its types
//! behind [`Stage`] so a workflow can hold a homogeneous list.

use crate::error::{ContractViolation, StepError};
use crate::session::Session;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// One typed stage of a workflow.
///
/// # Example
///
/// ```rust
/// use fgp_pipeline::{Document, Session, Step, StepError};
///
/// struct PageTitle;
///
/// impl Step for PageTitle {
///     type Input = Document;
///     type Output = String;
///
///     fn name(&self) -> &str {
///         "page-title"
///     }
///
///     fn run(&mut self, input: &Document, _session: &mut dyn Session) -> Result<String, StepError> {
///         input
///             .content
///             .split("<title>")
///             .nth(1)
///             .and_then(|rest| rest.split("</title>").next())
///             .map(str::to_string)
///             .ok_or_else(|| StepError::failed("page has no title"))
///     }
/// }
/// ```
pub trait Step: Send {
    type Input: Send + 'static;
    type Output: Clone + Send + 'static;

    fn name(&self) -> &str;

    /// Do the work. Any error is recorded as the step's failure.
    fn run(
        &mut self,
        input: &Self::Input,
        session: &mut dyn Session,
    ) -> Result<Self::Output, StepError>;

    /// Login capability, if this step authenticates the session.
    fn as_login(&mut self) -> Option<&mut dyn LoginCapable> {
        None
    }

    /// Snapshot consumer capability, if this step re-authenticates on its own.
    fn as_snapshot_consumer(&mut self) -> Option<&mut dyn NeedsLoginSnapshot> {
        None
    }
}

/// Username, password and optional base URL for login steps.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub base_url: Option<String>,
}

impl Credentials {
    /// Create new credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            base_url: None,
        }
    }

    /// Set the site base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Serialized state of a login step, enough to rebuild and rerun it.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginSnapshot {
    /// Step kind that produced the snapshot
    pub kind: String,

    pub state: Value,
}

impl LoginSnapshot {
    /// Capture the state of `step`.
    pub fn capture<T: Serialize>(kind: &str, step: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            state: serde_json::to_value(step)?,
        })
    }

    /// Rebuild the captured state.
    pub fn restore<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}

impl fmt::Debug for LoginSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The state carries the password.
        f.debug_struct("LoginSnapshot")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A step that authenticates the session.
pub trait LoginCapable {
    fn set_credentials(&mut self, credentials: &Credentials);

    fn snapshot(&self) -> Result<LoginSnapshot, serde_json::Error>;
}

/// A step that needs the most recent login to authenticate independently,
/// e.g. from fan-out workers with their own sessions.
pub trait NeedsLoginSnapshot {
    fn accept_snapshot(&mut self, snapshot: LoginSnapshot);
}

/// Runtime identity of a stage's input or output type.
#[derive(Debug, Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Get the tag of `T`.
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Get the type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

/// A value passed between type-erased stages.
pub struct StageValue {
    value: Box<dyn Any + Send>,
    tag: TypeTag,
}

impl StageValue {
    /// Wrap `value`.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            tag: TypeTag::of::<T>(),
        }
    }

    /// Get the tag of the wrapped value.
    pub fn type_tag(&self) -> TypeTag {
        self.tag
    }

    /// Recover the typed value, or give the value back on mismatch.
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let tag = self.tag;
        self.value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|value| Self { value, tag })
    }
}

impl fmt::Debug for StageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageValue")
            .field("type", &self.tag.name)
            .finish_non_exhaustive()
    }
}

/// Execution state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    NotRun,
    Succeeded,
    Failed,
}

/// A step with its single-use execution state.
pub struct StepCell<S: Step> {
    step: S,
    input: Option<S::Input>,
    output: Option<S::Output>,
    failure: Option<Arc<StepError>>,
    status: StepStatus,
}

impl<S: Step> StepCell<S> {
    /// Create a new step cell.
    pub fn new(step: S) -> Self {
        Self {
            step,
            input: None,
            output: None,
            failure: None,
            status: StepStatus::NotRun,
        }
    }

    /// Create a step cell with its input already set.
    pub fn with_input(step: S, input: S::Input) -> Self {
        let mut cell = Self::new(step);
        cell.input = Some(input);
        cell
    }

    /// Assign the upstream output. Rejected once the step has run.
    pub fn set_input(&mut self, input: S::Input) -> Result<(), ContractViolation> {
        if self.status != StepStatus::NotRun {
            return Err(ContractViolation::AlreadyExecuted {
                step: self.step.name().to_string(),
            });
        }
        self.input = Some(input);
        Ok(())
    }

    /// Run the step once. Later calls leave the recorded outcome untouched.
    pub fn execute(&mut self, session: &mut dyn Session) -> StepStatus {
        if self.status != StepStatus::NotRun {
            tracing::debug!(step = %self.step.name(), "Step already executed, ignoring");
            return self.status;
        }

        let start = Instant::now();
        let result = match &self.input {
            Some(input) => self.step.run(input, session),
            None => Err(StepError::MissingInput),
        };
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                tracing::debug!(step = %self.step.name(), duration_ms, "Step succeeded");
                self.output = Some(output);
                self.status = StepStatus::Succeeded;
            }
            Err(err) => {
                tracing::warn!(step = %self.step.name(), duration_ms, error = %err, "Step failed");
                self.failure = Some(Arc::new(err));
                self.status = StepStatus::Failed;
            }
        }
        self.status
    }

    /// Get the wrapped step.
    pub fn step(&self) -> &S {
        &self.step
    }

    /// Get the input, if set.
    pub fn input(&self) -> Option<&S::Input> {
        self.input.as_ref()
    }

    /// Get the output, if the step succeeded.
    pub fn output(&self) -> Option<&S::Output> {
        self.output.as_ref()
    }

    /// Get the failure, if the step failed.
    pub fn failure(&self) -> Option<&StepError> {
        self.failure.as_deref()
    }

    /// Get the step status.
    pub fn status(&self) -> StepStatus {
        self.status
    }
}

/// Type-erased view of a [`StepCell`], as held by a workflow.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn input_type(&self) -> TypeTag;

    fn output_type(&self) -> TypeTag;

    fn status(&self) -> StepStatus;

    fn set_input(&mut self, value: StageValue) -> Result<(), ContractViolation>;

    fn execute(&mut self, session: &mut dyn Session) -> StepStatus;

    /// A copy of the output, once the stage succeeded.
    fn output(&self) -> Option<StageValue>;

    /// The recorded failure, shared with the error it surfaced as.
    fn failure(&self) -> Option<&Arc<StepError>>;

    fn as_login(&mut self) -> Option<&mut dyn LoginCapable>;

    fn as_snapshot_consumer(&mut self) -> Option<&mut dyn NeedsLoginSnapshot>;
}

impl<S: Step + 'static> Stage for StepCell<S> {
    fn name(&self) -> &str {
        self.step.name()
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<S::Input>()
    }

    fn output_type(&self) -> TypeTag {
        TypeTag::of::<S::Output>()
    }

    fn status(&self) -> StepStatus {
        self.status
    }

    fn set_input(&mut self, value: StageValue) -> Result<(), ContractViolation> {
        let found = value.type_tag().name();
        let input = value
            .downcast::<S::Input>()
            .map_err(|_| ContractViolation::InputType {
                step: self.step.name().to_string(),
                expected: std::any::type_name::<S::Input>(),
                found,
            })?;
        StepCell::set_input(self, input)
    }

    fn execute(&mut self, session: &mut dyn Session) -> StepStatus {
        StepCell::execute(self, session)
    }

    fn output(&self) -> Option<StageValue> {
        self.output.clone().map(StageValue::new)
    }

    fn failure(&self) -> Option<&Arc<StepError>> {
        self.failure.as_ref()
    }

    fn as_login(&mut self) -> Option<&mut dyn LoginCapable> {
        self.step.as_login()
    }

    fn as_snapshot_consumer(&mut self) -> Option<&mut dyn NeedsLoginSnapshot> {
        self.step.as_snapshot_consumer()
    }
}
