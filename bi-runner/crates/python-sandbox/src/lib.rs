//! Python Sandbox - tiered snippet execution for BI analysis via RustPython
//!
//! This crate runs short Python snippets written by an analysis agent:
//! - A fresh interpreter per call, so nothing leaks between executions
//! - Datasets, libraries and caller variables injected into the namespace
//! - Printed output captured under a process-wide lock
//! - Two tiers: permissive, and restricted (static checks plus runtime guards)

pub mod capability;
pub mod dataset;
pub mod environment;
pub mod identifier;
pub mod interpreter;
pub mod output;
pub mod permissive;
pub mod protocol;
pub mod restricted;
mod runner;

use std::sync::Arc;

pub use capability::{default_libraries, AttributePolicy, BuiltinSet, CapabilityProfile, LibraryHandle};
pub use dataset::{CellValue, DatasetBundle, DatasetProvider, Table};
pub use environment::{BindingLayer, EnvironmentBuilder, ExecutionNamespace};
pub use output::OutputCapture;
pub use permissive::PermissiveExecutor;
pub use protocol::{ExecutionError, ExecutionResult, ExecutionTier, VariableBindings};
pub use restricted::{ExecutionState, RestrictedExecutor};
pub use runner::INTERNAL_ERROR;

/// Runs one snippet against a fresh namespace.
///
/// Never panics outward. A result is either a success carrying the captured
/// output, or a failure carrying an error and no output.
pub trait SnippetExecutor: Send + Sync {
    fn tier(&self) -> ExecutionTier;

    fn profile(&self) -> &CapabilityProfile;

    fn execute(&self, code: &str, variables: &VariableBindings) -> ExecutionResult;
}

/// Build the executor for `tier`
pub fn create_executor(
    tier: ExecutionTier,
    profile: CapabilityProfile,
    provider: Arc<dyn DatasetProvider>,
) -> Arc<dyn SnippetExecutor> {
    tracing::debug!(%tier, libraries = profile.libraries.len(), "creating executor");
    match tier {
        ExecutionTier::Permissive => Arc::new(PermissiveExecutor::new(profile, provider)),
        ExecutionTier::Restricted => Arc::new(RestrictedExecutor::new(profile, provider)),
    }
}
