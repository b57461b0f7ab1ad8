//! Executor Actor - snippet execution off the async runtime
//!
//! The sandbox's `execute` is synchronous and may run for as long as the
//! snippet does. This actor owns the executor, runs each request on a
//! blocking worker and stops waiting once the configured deadline passes.
//! A worker that outlives its deadline is abandoned, not killed: it keeps
//! the capture lock until the snippet finishes on its own.

use python_sandbox::{ExecutionResult, ExecutionTier, SnippetExecutor, VariableBindings};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Maximum output size (in bytes)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("execution {exec_id} exceeded the {timeout_secs}s deadline")]
    Timeout { exec_id: String, timeout_secs: u64 },

    #[error("execution worker failed: {0}")]
    WorkerFailed(String),

    #[error("executor actor is not running")]
    Unavailable,
}

/// Message types for the executor actor
pub enum ExecutorMsg {
    Execute {
        code: String,
        variables: VariableBindings,
        respond_to: oneshot::Sender<Result<SnippetRun, ActorError>>,
    },
    /// Run a trivial snippet to prove the interpreter works
    HealthCheck { respond_to: oneshot::Sender<bool> },
}

/// One completed execution
#[derive(Debug, Clone, Serialize)]
pub struct SnippetRun {
    pub exec_id: String,
    pub tier: ExecutionTier,
    pub result: ExecutionResult,
    pub duration_ms: u64,
    /// Output was cut at the size limit
    pub truncated: bool,
}

pub struct ExecutorActor {
    rx: mpsc::Receiver<ExecutorMsg>,
    executor: Arc<dyn SnippetExecutor>,
    timeout: Option<Duration>,
}

impl ExecutorActor {
    pub fn new(rx: mpsc::Receiver<ExecutorMsg>, executor: Arc<dyn SnippetExecutor>, timeout: Option<Duration>) -> Self {
        Self { rx, executor, timeout }
    }

    pub async fn run(mut self) {
        tracing::info!(tier = %self.executor.tier(), "executor actor starting");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                ExecutorMsg::Execute {
                    code,
                    variables,
                    respond_to,
                } => {
                    let outcome = self.execute_snippet(code, variables).await;
                    let _ = respond_to.send(outcome);
                }
                ExecutorMsg::HealthCheck { respond_to } => {
                    let healthy = self.health_check().await;
                    let _ = respond_to.send(healthy);
                }
            }
        }

        tracing::info!("executor actor channel closed, shutting down");
    }

    async fn execute_snippet(&self, code: String, variables: VariableBindings) -> Result<SnippetRun, ActorError> {
        let exec_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        tracing::debug!(%exec_id, lines = code.lines().count(), "executing snippet");

        let executor = Arc::clone(&self.executor);
        let worker = tokio::task::spawn_blocking(move || executor.execute(&code, &variables));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(%exec_id, timeout_secs = limit.as_secs(), "snippet exceeded deadline, abandoning worker");
                    return Err(ActorError::Timeout {
                        exec_id,
                        timeout_secs: limit.as_secs(),
                    });
                }
            },
            None => worker.await,
        };
        let mut result = joined.map_err(|e| ActorError::WorkerFailed(e.to_string()))?;

        let truncated = truncate_output(&mut result.output, MAX_OUTPUT_SIZE);
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result.error {
            None => tracing::info!(%exec_id, duration_ms, output_bytes = result.output.len(), "snippet succeeded"),
            Some(error) => tracing::info!(%exec_id, duration_ms, kind = error.kind(), %error, "snippet failed"),
        }

        Ok(SnippetRun {
            exec_id,
            tier: self.executor.tier(),
            result,
            duration_ms,
            truncated,
        })
    }

    async fn health_check(&self) -> bool {
        match self.execute_snippet("print('ok')".to_string(), VariableBindings::new()).await {
            Ok(run) => run.result.success && run.result.output == "ok\n",
            Err(e) => {
                tracing::warn!(error = %e, "executor health check failed");
                false
            }
        }
    }
}

/// Cut `output` to at most `limit` bytes on a char boundary. Returns whether it was cut.
fn truncate_output(output: &mut String, limit: usize) -> bool {
    if output.len() <= limit {
        return false;
    }
    let mut cut = limit;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str("\n... [output truncated]");
    true
}

/// Create a channel for communicating with the executor actor
pub fn create_executor_channel() -> (mpsc::Sender<ExecutorMsg>, mpsc::Receiver<ExecutorMsg>) {
    mpsc::channel(32)
}

/// Async client for a running [`ExecutorActor`]
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<ExecutorMsg>,
}

impl ExecutorHandle {
    /// Spawn an actor on the current runtime and return its handle
    pub fn spawn(executor: Arc<dyn SnippetExecutor>, timeout: Option<Duration>) -> Self {
        let (tx, rx) = create_executor_channel();
        tokio::spawn(ExecutorActor::new(rx, executor, timeout).run());
        Self { tx }
    }

    pub async fn execute(&self, code: impl Into<String>, variables: VariableBindings) -> Result<SnippetRun, ActorError> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(ExecutorMsg::Execute {
                code: code.into(),
                variables,
                respond_to,
            })
            .await
            .map_err(|_| ActorError::Unavailable)?;
        response.await.map_err(|_| ActorError::Unavailable)?
    }

    pub async fn health_check(&self) -> bool {
        let (respond_to, response) = oneshot::channel();
        if self.tx.send(ExecutorMsg::HealthCheck { respond_to }).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use python_sandbox::{create_executor, default_libraries, CapabilityProfile, DatasetBundle};

    fn handle(tier: ExecutionTier, timeout: Option<Duration>) -> ExecutorHandle {
        let executor = create_executor(
            tier,
            CapabilityProfile::for_tier(tier, default_libraries()),
            Arc::new(DatasetBundle::new()),
        );
        ExecutorHandle::spawn(executor, timeout)
    }

    #[test]
    fn test_truncate_output_respects_char_boundaries() {
        let mut output = "ééé".to_string();
        assert!(truncate_output(&mut output, 3));
        assert_eq!(output, "é\n... [output truncated]");

        let mut short = "ok".to_string();
        assert!(!truncate_output(&mut short, 3));
        assert_eq!(short, "ok");
    }

    #[tokio::test]
    async fn test_simple_execution() {
        let handle = handle(ExecutionTier::Restricted, Some(Duration::from_secs(60)));
        let run = handle.execute("x = 1 + 2\nprint(x)", VariableBindings::new()).await.unwrap();
        assert!(run.result.success);
        assert_eq!(run.result.output, "3\n");
        assert_eq!(run.tier, ExecutionTier::Restricted);
        assert!(!run.exec_id.is_empty());
        assert!(!run.truncated);
    }

    #[tokio::test]
    async fn test_each_run_gets_its_own_id() {
        let handle = handle(ExecutionTier::Permissive, None);
        let first = handle.execute("pass", VariableBindings::new()).await.unwrap();
        let second = handle.execute("pass", VariableBindings::new()).await.unwrap();
        assert_ne!(first.exec_id, second.exec_id);
    }

    #[tokio::test]
    async fn test_failed_snippet_is_a_result_not_an_actor_error() {
        let handle = handle(ExecutionTier::Restricted, Some(Duration::from_secs(60)));
        let run = handle.execute("import os", VariableBindings::new()).await.unwrap();
        assert!(!run.result.success);
        assert_eq!(run.result.error.map(|e| e.kind()), Some("capability_violation"));
    }

    #[tokio::test]
    async fn test_deadline_abandons_long_runs() {
        let handle = handle(ExecutionTier::Permissive, Some(Duration::from_millis(200)));
        let outcome = handle
            .execute("import time\ntime.sleep(2)\nprint('late')", VariableBindings::new())
            .await;
        assert!(matches!(outcome, Err(ActorError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_health_check() {
        let handle = handle(ExecutionTier::Restricted, Some(Duration::from_secs(60)));
        assert!(handle.health_check().await);
    }

    #[tokio::test]
    async fn test_closed_actor_is_unavailable() {
        let (tx, rx) = create_executor_channel();
        drop(rx);
        let handle = ExecutorHandle { tx };
        assert!(matches!(
            handle.execute("print(1)", VariableBindings::new()).await,
            Err(ActorError::Unavailable)
        ));
        assert!(!handle.health_check().await);
    }
}
