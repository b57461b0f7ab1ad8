//! Protocol types shared between executors and their callers
//!
//! Every execution, whatever its tier, answers with an [`ExecutionResult`].
//! Failures carry a structured [`ExecutionError`] so the agent loop can tell
//! a syntax mistake from a capability violation from a runtime exception.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Caller-supplied variables for a single execution.
pub type VariableBindings = serde_json::Map<String, Value>;

/// Trust tier an executor runs snippets under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    /// Full builtins and unrestricted imports
    #[serde(alias = "local")]
    Permissive,
    /// Grammar checks plus guarded attribute access
    #[default]
    #[serde(alias = "restricted_local")]
    Restricted,
}

impl ExecutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionTier::Permissive => "permissive",
            ExecutionTier::Restricted => "restricted",
        }
    }
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissive" | "local" => Ok(ExecutionTier::Permissive),
            "restricted" | "restricted_local" => Ok(ExecutionTier::Restricted),
            other => Err(format!(
                "unknown executor tier '{}' (expected permissive|local|restricted|restricted_local)",
                other
            )),
        }
    }
}

/// Why an execution failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The snippet is not valid Python
    #[error("SyntaxError: {message}{}", fmt_location(.line, .column))]
    Compilation {
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },

    /// The snippet used a construct its tier does not allow
    #[error("CapabilityViolation: {message}{}", fmt_location(.line, &None))]
    CapabilityViolation {
        /// Short name of the offending construct, e.g. `import os` or `attribute '__class__'`
        construct: String,
        message: String,
        line: Option<usize>,
    },

    /// An exception escaped the snippet
    #[error("{exception}: {message}")]
    Runtime {
        /// Exception class name
        exception: String,
        message: String,
        traceback: Option<String>,
    },
}

fn fmt_location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(l), Some(c)) => format!(" (line {}, column {})", l, c),
        (Some(l), None) => format!(" (line {})", l),
        _ => String::new(),
    }
}

impl ExecutionError {
    pub fn compilation(message: impl Into<String>, line: Option<usize>, column: Option<usize>) -> Self {
        ExecutionError::Compilation {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn violation(construct: impl Into<String>, message: impl Into<String>, line: Option<usize>) -> Self {
        ExecutionError::CapabilityViolation {
            construct: construct.into(),
            message: message.into(),
            line,
        }
    }

    pub fn runtime(exception: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionError::Runtime {
            exception: exception.into(),
            message: message.into(),
            traceback: None,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Compilation { .. } => "compilation",
            ExecutionError::CapabilityViolation { .. } => "capability_violation",
            ExecutionError::Runtime { .. } => "runtime",
        }
    }
}

/// Result of one `execute` call
///
/// Exactly one of the two shapes holds: `success` with the captured output and
/// no error, or failure with an error and empty output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    /// Failed result. Anything printed before the failure is discarded.
    pub fn failure(error: ExecutionError) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
        }
    }

    /// Plain-text error, as the agent loop shows it to the model
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}
