//! Shared run phase for both tiers
//!
//! Opens the capture window, runs the snippet in a fresh interpreter and
//! turns whatever happened into an [`ExecutionResult`]. Output captured by a
//! failed run is discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::capability::CapabilityProfile;
use crate::dataset::DatasetBundle;
use crate::environment::EnvironmentBuilder;
use crate::interpreter::{compile_snippet, create_interpreter, exception_to_execution_error};
use crate::output::OutputCapture;
use crate::protocol::{ExecutionError, ExecutionResult, VariableBindings};
use crate::restricted::guards::ViolationLog;

/// Exception class reported when the interpreter itself panicked
pub const INTERNAL_ERROR: &str = "InternalError";

/// Run `source` (already parsed, and rewritten for the restricted tier).
/// Passing a violation log installs the restricted guard layer.
pub(crate) fn run_snippet(
    source: &str,
    profile: &CapabilityProfile,
    datasets: &DatasetBundle,
    variables: &VariableBindings,
    violations: Option<&ViolationLog>,
) -> ExecutionResult {
    let capture = OutputCapture::begin();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_in_fresh_interpreter(source, profile, datasets, variables, violations, &capture)
    }))
    .unwrap_or_else(|payload| Err(panic_to_execution_error(payload)));

    let output = capture.finish();

    // A refusal the snippet caught still fails the run
    let outcome = match violations.and_then(ViolationLog::first) {
        Some(violation) => Err(ExecutionError::violation(violation.construct, violation.message, None)),
        None => outcome,
    };

    match outcome {
        Ok(()) => ExecutionResult::success(output),
        Err(error) => {
            if !output.is_empty() {
                tracing::debug!(discarded_bytes = output.len(), "discarding output of failed execution");
            }
            ExecutionResult::failure(error)
        }
    }
}

fn run_in_fresh_interpreter(
    source: &str,
    profile: &CapabilityProfile,
    datasets: &DatasetBundle,
    variables: &VariableBindings,
    violations: Option<&ViolationLog>,
    capture: &OutputCapture,
) -> Result<(), ExecutionError> {
    let interpreter = create_interpreter();
    interpreter.enter(|vm| {
        let code = compile_snippet(vm, source)?;

        let mut builder = EnvironmentBuilder::new(profile, datasets);
        if let Some(log) = violations {
            builder = builder.with_guards(capture.sink(), log);
        }
        let namespace = builder
            .build(vm, variables)
            .map_err(|exc| exception_to_execution_error(vm, &exc))?;

        let _redirect = capture
            .redirect(vm)
            .map_err(|exc| exception_to_execution_error(vm, &exc))?;

        vm.run_code_obj(code, namespace.scope)
            .map(drop)
            .map_err(|exc| exception_to_execution_error(vm, &exc))
    })
}

fn panic_to_execution_error(payload: Box<dyn Any + Send>) -> ExecutionError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "interpreter panicked".to_string());
    tracing::error!(%message, "interpreter panicked during execution");
    ExecutionError::runtime(INTERNAL_ERROR, message)
}
