//! Restricted tier
//!
//! Two-phase enforcement: the static [`validator`] refuses constructs outside
//! the tier before anything runs, and the [`rewrite`] routes every attribute
//! read through the runtime [`guards`].

pub mod guards;
pub mod rewrite;
pub mod validator;

use std::sync::Arc;

use crate::capability::{BuiltinSet, CapabilityProfile};
use crate::dataset::{DatasetBundle, DatasetProvider};
use crate::environment::EnvironmentBuilder;
use crate::interpreter::parse_snippet;
use crate::protocol::{ExecutionError, ExecutionResult, ExecutionTier, VariableBindings};
use crate::runner::run_snippet;
use crate::SnippetExecutor;

use guards::ViolationLog;
use rewrite::guard_attribute_reads;
use validator::validate_snippet;

/// Lifecycle of one restricted execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Received,
    Compiling,
    Rejected,
    Compiled,
    Running,
    Failed,
    Succeeded,
}

impl ExecutionState {
    pub fn can_advance_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Received, Compiling)
                | (Compiling, Rejected)
                | (Compiling, Compiled)
                | (Compiled, Running)
                | (Running, Failed)
                | (Running, Succeeded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Rejected | ExecutionState::Failed | ExecutionState::Succeeded)
    }

    fn advance(self, next: ExecutionState) -> ExecutionState {
        debug_assert!(self.can_advance_to(next), "{:?} -> {:?}", self, next);
        tracing::debug!(from = ?self, to = ?next, "restricted execution state");
        next
    }
}

pub struct RestrictedExecutor {
    profile: Arc<CapabilityProfile>,
    datasets: Arc<dyn DatasetProvider>,
}

impl RestrictedExecutor {
    /// The profile's builtin set and attribute guarding are forced to the
    /// restricted settings; its libraries and attribute policy are kept.
    pub fn new(mut profile: CapabilityProfile, datasets: Arc<dyn DatasetProvider>) -> Self {
        if profile.builtin_set != BuiltinSet::SafeSubset || !profile.guarded_attribute_access {
            tracing::warn!("restricted executor given an unguarded profile; enforcing restricted settings");
            profile.builtin_set = BuiltinSet::SafeSubset;
            profile.guarded_attribute_access = true;
        }
        Self {
            profile: Arc::new(profile),
            datasets,
        }
    }

    /// Parse, validate and rewrite. `Ok(None)` means there is nothing to run.
    fn compile(
        &self,
        code: &str,
        datasets: &DatasetBundle,
        variables: &VariableBindings,
    ) -> Result<Option<String>, ExecutionError> {
        let suite = parse_snippet(code)?;
        if suite.is_empty() {
            return Ok(None);
        }

        let names = EnvironmentBuilder::new(&self.profile, datasets).namespace_names(variables);
        let analysis = validate_snippet(code, &suite, &self.profile, &names)?;
        guard_attribute_reads(code, &analysis.attribute_loads).map(Some)
    }
}

impl SnippetExecutor for RestrictedExecutor {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Restricted
    }

    fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    fn execute(&self, code: &str, variables: &VariableBindings) -> ExecutionResult {
        let state = ExecutionState::Received.advance(ExecutionState::Compiling);
        let datasets = self.datasets.load_all();

        let source = match self.compile(code, &datasets, variables) {
            Ok(source) => source,
            Err(error) => {
                state.advance(ExecutionState::Rejected);
                tracing::info!(kind = error.kind(), "restricted snippet rejected");
                return ExecutionResult::failure(error);
            }
        };
        let state = state.advance(ExecutionState::Compiled).advance(ExecutionState::Running);

        let Some(source) = source else {
            state.advance(ExecutionState::Succeeded);
            return ExecutionResult::success("");
        };

        let violations = ViolationLog::new();
        let result = run_snippet(&source, &self.profile, &datasets, variables, Some(&violations));

        let end = if result.success {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        };
        state.advance(end);
        result
    }
}
