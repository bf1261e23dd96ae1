//! Step dispatch.
//!
//! Each step is one of three things, decided in order: a group (has child
//! steps), an operation (has a run command or copy instruction), or a
//! standalone modifier. Groups apply their own modifiers to the persistent
//! state and recurse; operations see a resolved view that overlays their
//! step-level modifiers without touching the persistent state.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::build::copy::execute_copy;
use crate::build::state::StepState;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::recipe::Step;

/// Executes a list of steps in order against the build container.
pub(crate) async fn execute_steps(
    ctr: &Container,
    steps: &[Step],
    state: &mut StepState,
    build_ctx: &Path,
    stages: &HashMap<String, Container>,
) -> Result<()> {
    for (i, step) in steps.iter().enumerate() {
        if let Err(err) = execute_step(ctr, step, state, build_ctx, stages).await {
            return Err(Error::Step {
                index: i + 1,
                source: Box::new(err),
            });
        }
    }
    Ok(())
}

/// Executes a single step, dispatching to group recursion, operation
/// execution, or state mutation depending on the step's fields.
async fn execute_step(
    ctr: &Container,
    step: &Step,
    state: &mut StepState,
    build_ctx: &Path,
    stages: &HashMap<String, Container>,
) -> Result<()> {
    // Group: apply group-level modifiers and recurse.
    if !step.steps.is_empty() {
        state.apply(step);
        return Box::pin(execute_steps(ctr, &step.steps, state, build_ctx, stages)).await;
    }

    // Operation with optional scoped modifiers.
    if step.has_operation() {
        return execute_operation(ctr, step, state, build_ctx, stages).await;
    }

    // Standalone modifier(s): persist in state.
    state.apply(step);
    Ok(())
}

/// Executes a run or copy operation with scoped modifier overrides.
///
/// Step-level modifiers override the persistent state for this operation
/// only; the persistent state is not modified.
async fn execute_operation(
    ctr: &Container,
    step: &Step,
    state: &StepState,
    build_ctx: &Path,
    stages: &HashMap<String, Container>,
) -> Result<()> {
    let resolved = state.resolve(step);

    if !resolved.workdir.is_empty() {
        ctr.mkdir_all(&resolved.workdir).await?;
    }

    if !step.run.is_empty() {
        debug!("run {:?} (shell: {})", step.run, resolved.shell);
        let result = ctr
            .exec(&resolved.shell, &step.run, &resolved.environ(), &resolved.workdir)
            .await?;
        if result.exit_code != 0 {
            return Err(Error::CommandFailed {
                code: result.exit_code,
                stderr: result.stderr,
            });
        }
    } else if !step.copy.is_empty() {
        execute_copy(ctr, &step.copy, &resolved.workdir, build_ctx, stages).await?;
    }

    Ok(())
}
