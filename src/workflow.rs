//! Workflow definition and builder.

use crate::error::{ContractViolation, WorkflowError};
use crate::session::SessionFactory;
use crate::step::{Credentials, LoginSnapshot, Stage, StageValue, Step, StepCell, TypeTag};
use crate::yaml::RunFlags;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// An ordered list of stages sharing one session per run, yielding `R`.
pub struct Workflow<R> {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) stages: Vec<Box<dyn Stage>>,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) flags: RunFlags,
    pub(crate) last_login_snapshot: Option<LoginSnapshot>,
    pub(crate) executed: bool,
    _output: PhantomData<fn() -> R>,
}

impl Workflow<()> {
    /// Start a typed workflow whose first step takes `()`.
    pub fn builder(name: &str) -> WorkflowBuilder<()> {
        WorkflowBuilder::new(name)
    }
}

impl<R: 'static> Workflow<R> {
    /// Assemble a workflow from already type-erased stages, e.g. built from
    /// a description. The first stage must take `()`, each stage must take
    /// what the previous one produces, and the last must produce `R`.
    pub fn from_stages(
        name: &str,
        mut stages: Vec<Box<dyn Stage>>,
        factory: Arc<dyn SessionFactory>,
        flags: RunFlags,
    ) -> Result<Self, WorkflowError> {
        let first = stages.first_mut().ok_or(WorkflowError::Empty)?;
        let unit = TypeTag::of::<()>();
        if first.input_type() != unit {
            return Err(WorkflowError::Incompatible {
                index: 0,
                step: first.name().to_string(),
                expected: first.input_type().name(),
                found: unit.name(),
            });
        }
        first.set_input(StageValue::new(()))?;

        for (index, pair) in stages.windows(2).enumerate() {
            let (upstream, stage) = (&pair[0], &pair[1]);
            if upstream.output_type() != stage.input_type() {
                return Err(WorkflowError::Incompatible {
                    index: index + 1,
                    step: stage.name().to_string(),
                    expected: stage.input_type().name(),
                    found: upstream.output_type().name(),
                });
            }
        }

        let last = stages.last().map(|s| s.output_type()).ok_or(WorkflowError::Empty)?;
        if last != TypeTag::of::<R>() {
            return Err(ContractViolation::OutputType {
                expected: std::any::type_name::<R>(),
                found: last.name(),
            }
            .into());
        }

        Ok(Self::assemble(name, None, stages, factory, flags))
    }

    fn assemble(
        name: &str,
        description: Option<String>,
        stages: Vec<Box<dyn Stage>>,
        factory: Arc<dyn SessionFactory>,
        flags: RunFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            description,
            stages,
            factory,
            flags,
            last_login_snapshot: None,
            executed: false,
            _output: PhantomData,
        }
    }

    /// Set the workflow description.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Seed the login snapshot for already-authenticated runs.
    pub fn with_login_snapshot(mut self, snapshot: LoginSnapshot) -> Self {
        self.last_login_snapshot = Some(snapshot);
        self
    }

    /// Get the workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the workflow description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Get the run flags.
    pub fn flags(&self) -> &RunFlags {
        &self.flags
    }

    /// Get the stages in run order.
    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Snapshot of the most recent login step, once credentials were injected.
    pub fn last_login_snapshot(&self) -> Option<&LoginSnapshot> {
        self.last_login_snapshot.as_ref()
    }

    /// Run every stage without injecting credentials.
    pub fn execute(&mut self) -> Result<R, WorkflowError> {
        crate::executor::execute(self, None)
    }

    /// Inject `credentials` into the login steps, then run every stage.
    pub fn execute_with_credentials(&mut self, credentials: &Credentials) -> Result<R, WorkflowError> {
        crate::executor::execute(self, Some(credentials))
    }
}

impl<R> fmt::Debug for Workflow<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("stages", &stages)
            .field("flags", &self.flags)
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

/// Builder chaining steps whose types line up at compile time.
///
/// `T` is the output type of the last step added so far.
///
/// ```rust
/// use fgp_pipeline::{OpenPage, StaticSessionFactory, Workflow};
/// use std::collections::HashMap;
/// use std::sync::Arc;
///
/// let mut pages = HashMap::new();
/// pages.insert("https://example.test/".to_string(), "hello".to_string());
///
/// let mut workflow = Workflow::builder("greeting")
///     .then(OpenPage::new("https://example.test/"))
///     .build(Arc::new(StaticSessionFactory::new(pages)))
///     .unwrap();
///
/// assert_eq!(workflow.execute().unwrap().content, "hello");
/// ```
pub struct WorkflowBuilder<T> {
    name: String,
    description: Option<String>,
    flags: RunFlags,
    stages: Vec<Box<dyn Stage>>,
    initial: Option<T>,
}

impl WorkflowBuilder<()> {
    /// Create a new workflow builder.
    pub fn new(name: &str) -> Self {
        Self::with_input(name, ())
    }
}

impl<T: Send + 'static> WorkflowBuilder<T> {
    /// Start a workflow whose first step takes `input`.
    pub fn with_input(name: &str, input: T) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            flags: RunFlags::default(),
            stages: Vec::new(),
            initial: Some(input),
        }
    }

    /// Set the workflow description.
    pub fn description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }

    /// Set the run flags.
    pub fn flags(mut self, flags: RunFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Append a step consuming the current output type.
    pub fn then<S>(mut self, step: S) -> WorkflowBuilder<S::Output>
    where
        S: Step<Input = T> + 'static,
    {
        let cell = match self.initial.take() {
            Some(input) => StepCell::with_input(step, input),
            None => StepCell::new(step),
        };
        self.stages.push(Box::new(cell));

        WorkflowBuilder {
            name: self.name,
            description: self.description,
            flags: self.flags,
            stages: self.stages,
            initial: None,
        }
    }

    /// Append a type-erased stage; compatibility is checked here instead
    /// of at compile time.
    pub fn then_stage<U: Any + Send>(
        mut self,
        mut stage: Box<dyn Stage>,
    ) -> Result<WorkflowBuilder<U>, WorkflowError> {
        let expected = TypeTag::of::<T>();
        if stage.input_type() != expected {
            return Err(WorkflowError::Incompatible {
                index: self.stages.len(),
                step: stage.name().to_string(),
                expected: stage.input_type().name(),
                found: expected.name(),
            });
        }
        if stage.output_type() != TypeTag::of::<U>() {
            return Err(ContractViolation::OutputType {
                expected: std::any::type_name::<U>(),
                found: stage.output_type().name(),
            }
            .into());
        }
        if let Some(input) = self.initial.take() {
            stage.set_input(StageValue::new(input))?;
        }
        self.stages.push(stage);

        Ok(WorkflowBuilder {
            name: self.name,
            description: self.description,
            flags: self.flags,
            stages: self.stages,
            initial: None,
        })
    }

    /// Build the workflow; its result is the last step's output.
    pub fn build(self, factory: Arc<dyn SessionFactory>) -> Result<Workflow<T>, WorkflowError> {
        if self.stages.is_empty() {
            return Err(WorkflowError::Empty);
        }
        Ok(Workflow::assemble(
            &self.name,
            self.description,
            self.stages,
            factory,
            self.flags,
        ))
    }
}
