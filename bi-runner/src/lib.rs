//! bi-runner: runs agent-written analysis snippets against local datasets.

pub mod cli;
pub mod dataset_loader;
pub mod executor_actor;
pub mod settings;
pub mod snippet_prep;
pub mod tabular_parser;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Context};
use cli::{apply_cli_overrides, collect_variables, resolve_snippet, CliArgs};
use dataset_loader::LocalDatasetManager;
use executor_actor::ExecutorHandle;
use python_sandbox::create_executor;
use settings::{load_settings, save_settings};
use std::sync::Arc;
use std::time::Duration;

/// Run one CLI invocation. Returns whether the snippet succeeded.
pub async fn run(args: CliArgs) -> anyhow::Result<bool> {
    let mut settings = load_settings(args.config.as_deref()).await;
    apply_cli_overrides(&args, &mut settings);

    if args.save_config {
        save_settings(&settings, args.config.as_deref())
            .await
            .context("saving settings")?;
    }

    let manager = LocalDatasetManager::new(settings.datasets.clone());

    if args.list_datasets {
        let listed = manager.list_datasets();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&listed)?);
        } else if listed.is_empty() {
            println!("No datasets configured");
        } else {
            for dataset in listed {
                println!("{}\t{}\t{}\t{}", dataset.name, dataset.file_type, dataset.path, dataset.description);
            }
        }
        return Ok(true);
    }

    let code = resolve_snippet(&args).map_err(|e| anyhow!(e))?;
    let variables = collect_variables(&args).map_err(|e| anyhow!(e))?;

    let executor = create_executor(
        settings.python_executor,
        settings.capability_profile(),
        Arc::new(manager),
    );
    let handle = ExecutorHandle::spawn(executor, settings.execution_timeout_secs.map(Duration::from_secs));

    let run = handle.execute(code, variables).await?;
    tracing::debug!(exec_id = %run.exec_id, duration_ms = run.duration_ms, "run finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else if run.result.success {
        print!("{}", run.result.output);
    } else if let Some(message) = run.result.error_message() {
        eprintln!("{}", message);
    }

    Ok(run.result.success)
}
