//! Workflow execution engine.

use crate::error::{ContractViolation, StepError, WorkflowError};
use crate::session::{Session, SessionGuard};
use crate::step::{Credentials, LoginSnapshot, Stage, StageValue, StepStatus};
use crate::workflow::Workflow;
use std::sync::Arc;
use std::time::Instant;

/// Execute a workflow once, end to end.
///
/// Credentials (when given) go to every login step first, and the snapshot
/// of the last login step goes to every step that asks for one. The session
/// is then opened, every stage runs in order with the previous output as its
/// input, and the session is closed on every exit path, including panics
/// inside a step. The first failing stage ends the run.
pub(crate) fn execute<R: 'static>(
    workflow: &mut Workflow<R>,
    credentials: Option<&Credentials>,
) -> Result<R, WorkflowError> {
    if workflow.executed {
        return Err(WorkflowError::AlreadyExecuted);
    }
    workflow.executed = true;

    tracing::info!(workflow = %workflow.name, steps = workflow.stages.len(), "Starting workflow");
    let start = Instant::now();

    if let Some(credentials) = credentials {
        if let Some(snapshot) = inject_credentials(&mut workflow.stages, credentials)? {
            workflow.last_login_snapshot = Some(snapshot);
        }
    }
    if let Some(snapshot) = &workflow.last_login_snapshot {
        inject_snapshot(&mut workflow.stages, snapshot);
    }

    let mut guard = SessionGuard::acquire(workflow.factory.as_ref(), &workflow.flags)?;
    let result = run_stages(&mut workflow.stages, guard.session());
    drop(guard);

    let total_ms = start.elapsed().as_secs_f64() * 1000.0;
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(workflow = %workflow.name, total_ms, error = %err, "Workflow failed");
            return Err(err);
        }
    };

    tracing::info!(workflow = %workflow.name, total_ms = total_ms, "Workflow completed");

    value.downcast::<R>().map_err(|value| {
        ContractViolation::OutputType {
            expected: std::any::type_name::<R>(),
            found: value.type_tag().name(),
        }
        .into()
    })
}

/// Hand credentials to every login step; returns the last step's snapshot.
fn inject_credentials(
    stages: &mut [Box<dyn Stage>],
    credentials: &Credentials,
) -> Result<Option<LoginSnapshot>, WorkflowError> {
    let mut snapshot = None;

    for stage in stages.iter_mut() {
        let name = stage.name().to_string();
        if let Some(login) = stage.as_login() {
            login.set_credentials(credentials);
            let captured = login.snapshot().map_err(|e| ContractViolation::Snapshot {
                step: name.clone(),
                message: e.to_string(),
            })?;
            tracing::debug!(step = %name, username = %credentials.username, "Injected credentials");
            snapshot = Some(captured);
        }
    }

    Ok(snapshot)
}

fn inject_snapshot(stages: &mut [Box<dyn Stage>], snapshot: &LoginSnapshot) {
    for stage in stages.iter_mut() {
        let name = stage.name().to_string();
        if let Some(consumer) = stage.as_snapshot_consumer() {
            consumer.accept_snapshot(snapshot.clone());
            tracing::debug!(step = %name, kind = %snapshot.kind, "Injected login snapshot");
        }
    }
}

fn run_stages(
    stages: &mut [Box<dyn Stage>],
    session: &mut dyn Session,
) -> Result<StageValue, WorkflowError> {
    let mut previous: Option<StageValue> = None;

    for (index, stage) in stages.iter_mut().enumerate() {
        if let Some(value) = previous.take() {
            stage.set_input(value)?;
        }

        tracing::debug!(step = index, name = %stage.name(), "Executing step");

        if stage.execute(session) != StepStatus::Succeeded {
            let err = stage
                .failure()
                .cloned()
                .unwrap_or_else(|| Arc::new(StepError::failed("step reported no outcome")));
            return Err(WorkflowError::from_step(stage.name(), err));
        }

        let output = stage.output().ok_or_else(|| ContractViolation::MissingOutput {
            step: stage.name().to_string(),
        })?;
        previous = Some(output);
    }

    previous.ok_or(WorkflowError::Empty)
}
