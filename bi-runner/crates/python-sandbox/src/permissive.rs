//! Permissive tier: full builtins, unrestricted imports, no attribute guard

use std::sync::Arc;

use crate::capability::CapabilityProfile;
use crate::dataset::DatasetProvider;
use crate::interpreter::parse_snippet;
use crate::protocol::{ExecutionResult, ExecutionTier, VariableBindings};
use crate::runner::run_snippet;
use crate::SnippetExecutor;

pub struct PermissiveExecutor {
    profile: Arc<CapabilityProfile>,
    datasets: Arc<dyn DatasetProvider>,
}

impl PermissiveExecutor {
    pub fn new(profile: CapabilityProfile, datasets: Arc<dyn DatasetProvider>) -> Self {
        Self {
            profile: Arc::new(profile),
            datasets,
        }
    }
}

impl SnippetExecutor for PermissiveExecutor {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Permissive
    }

    fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    fn execute(&self, code: &str, variables: &VariableBindings) -> ExecutionResult {
        // Parse up front for a located syntax error
        match parse_snippet(code) {
            Ok(suite) if suite.is_empty() => return ExecutionResult::success(""),
            Ok(_) => {}
            Err(error) => return ExecutionResult::failure(error),
        }

        let datasets = self.datasets.load_all();
        run_snippet(code, &self.profile, &datasets, variables, None)
    }
}
