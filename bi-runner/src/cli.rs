//! Command-line argument parsing and launch configuration.
//!
//! Arguments override the loaded settings for a single run; they are only
//! written back when `--save-config` is passed.

use crate::dataset_loader::LocalDataset;
use crate::settings::{enforce_dataset_names, AppSettings};
use crate::snippet_prep::snippet_from_response;
use clap::Parser;
use python_sandbox::{ExecutionTier, VariableBindings};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// CLI arguments for bi-runner
#[derive(Parser, Debug, Clone)]
#[command(name = "bi-runner", about = "Run BI analysis snippets against local datasets")]
pub struct CliArgs {
    /// Snippet source (string or @path/to/file); read from stdin when omitted or `-`
    #[arg(value_name = "CODE_OR_@FILE")]
    pub code: Option<String>,
    /// Settings file (defaults to ~/.bi-runner/config.json)
    #[arg(long, value_name = "PATH", env = "BI_RUNNER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Execution tier: permissive|local|restricted|restricted_local
    #[arg(long, value_name = "TIER", env = "BI_RUNNER_TIER")]
    pub tier: Option<ExecutionTier>,
    /// Register a dataset for this run (repeatable)
    #[arg(long = "dataset", value_name = "NAME=PATH")]
    pub datasets: Vec<String>,
    /// Bind a variable into the snippet namespace (repeatable). Values are
    /// JSON; anything that does not parse is bound as a string.
    #[arg(long = "var", value_name = "NAME=JSON_OR_@FILE")]
    pub vars: Vec<String>,
    /// Per-snippet deadline in seconds; 0 disables it
    #[arg(long, value_name = "SECS", env = "BI_RUNNER_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,
    /// Print the configured datasets and exit
    #[arg(long, default_value_t = false)]
    pub list_datasets: bool,
    /// Print results as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
    /// Treat the input as a model reply (fenced code or tool-call JSON)
    #[arg(long, default_value_t = false)]
    pub from_response: bool,
    /// Persist the effective settings after applying overrides
    #[arg(long, default_value_t = false)]
    pub save_config: bool,
}

/// Read a value that may be either a literal string or a @path reference to a file
pub fn read_value_or_file(raw: &str) -> Result<String, String> {
    if let Some(path) = raw.strip_prefix('@') {
        fs::read_to_string(Path::new(path)).map_err(|e| format!("Failed to read {}: {}", path, e))
    } else {
        Ok(raw.to_string())
    }
}

/// Parse a JSON value from either inline JSON or a @path reference
pub fn parse_json_or_file<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let data = read_value_or_file(raw)?;
    serde_json::from_str(&data).map_err(|e| format!("Failed to parse JSON: {}", e))
}

/// `NAME=PATH` into a dataset entry
pub fn parse_dataset_arg(raw: &str) -> Result<LocalDataset, String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.trim().is_empty() && !path.trim().is_empty() => {
            Ok(LocalDataset::new(name.trim(), path.trim()))
        }
        _ => Err(format!("Invalid --dataset '{}'. Expected NAME=PATH", raw)),
    }
}

/// `NAME=VALUE` into a variable binding
pub fn parse_var_arg(raw: &str) -> Result<(String, Value), String> {
    let (name, raw_value) = raw
        .split_once('=')
        .filter(|(name, _)| !name.trim().is_empty())
        .ok_or_else(|| format!("Invalid --var '{}'. Expected NAME=JSON_OR_@FILE", raw))?;

    let value = if raw_value.starts_with('@') {
        parse_json_or_file(raw_value)?
    } else {
        serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()))
    };
    Ok((name.trim().to_string(), value))
}

/// Collect every `--var` into the bindings handed to the executor
pub fn collect_variables(args: &CliArgs) -> Result<VariableBindings, String> {
    let mut variables = VariableBindings::new();
    for raw in &args.vars {
        let (name, value) = parse_var_arg(raw)?;
        if variables.insert(name.clone(), value).is_some() {
            tracing::warn!(variable = %name, "--var given more than once, last value wins");
        }
    }
    Ok(variables)
}

/// Apply CLI overrides to settings without persisting them.
pub fn apply_cli_overrides(args: &CliArgs, settings: &mut AppSettings) {
    if let Some(tier) = args.tier {
        tracing::info!(%tier, "executor tier overridden on the command line");
        settings.python_executor = tier;
    }

    if let Some(secs) = args.timeout_secs {
        settings.execution_timeout_secs = (secs > 0).then_some(secs);
    }

    for raw in &args.datasets {
        match parse_dataset_arg(raw) {
            Ok(dataset) => {
                settings.datasets.retain(|d| d.name != dataset.name);
                settings.datasets.push(dataset);
            }
            Err(e) => tracing::warn!("{}", e),
        }
    }

    enforce_dataset_names(settings);
}

/// Resolve the snippet source from the positional argument or stdin
pub fn resolve_snippet(args: &CliArgs) -> Result<String, String> {
    let input = match args.code.as_deref() {
        None | Some("-") => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| format!("Failed to read stdin: {}", e))?;
            buffer
        }
        Some(raw) => read_value_or_file(raw)?,
    };

    if args.from_response {
        snippet_from_response(&input).ok_or_else(|| "No Python program found in the response".to_string())
    } else {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn args(argv: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("bi-runner").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_parse() {
        let parsed = args(&[
            "--tier",
            "restricted_local",
            "--dataset",
            "sales=data/sales.csv",
            "--var",
            "limit=5",
            "--json",
            "print(1)",
        ]);
        assert_eq!(parsed.tier, Some(ExecutionTier::Restricted));
        assert_eq!(parsed.datasets, vec!["sales=data/sales.csv".to_string()]);
        assert!(parsed.json);
        assert_eq!(parsed.code.as_deref(), Some("print(1)"));

        assert!(CliArgs::try_parse_from(["bi-runner", "--tier", "docker"]).is_err());
    }

    #[test]
    fn test_var_values() {
        assert_eq!(parse_var_arg("limit=5").unwrap(), ("limit".to_string(), json!(5)));
        assert_eq!(
            parse_var_arg("regions=[\"north\", \"south\"]").unwrap().1,
            json!(["north", "south"])
        );
        assert_eq!(parse_var_arg("region=north").unwrap().1, json!("north"));
        assert_eq!(parse_var_arg("query=a=b").unwrap().1, json!("a=b"));
        assert!(parse_var_arg("=5").is_err());
        assert!(parse_var_arg("novalue").is_err());
    }

    #[test]
    fn test_var_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"threshold": 0.5}"#).unwrap();
        let raw = format!("cfg=@{}", file.path().display());
        assert_eq!(parse_var_arg(&raw).unwrap().1, json!({"threshold": 0.5}));
    }

    #[test]
    fn test_overrides_replace_datasets_by_name() {
        let mut settings = AppSettings::default();
        settings.datasets.push(LocalDataset::new("sales", "old.csv"));

        let parsed = args(&[
            "--tier",
            "local",
            "--timeout-secs",
            "0",
            "--dataset",
            "sales=new.csv",
            "--dataset",
            "Q3 Orders=orders.csv",
            "--dataset",
            "broken",
        ]);
        apply_cli_overrides(&parsed, &mut settings);

        assert_eq!(settings.python_executor, ExecutionTier::Permissive);
        assert_eq!(settings.execution_timeout_secs, None);
        let names: Vec<_> = settings.datasets.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sales", "q3_orders"]);
        assert_eq!(settings.datasets[0].path, PathBuf::from("new.csv"));
    }

    #[test]
    fn test_resolve_snippet_from_file_and_response() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Here you go:\n```python\nprint(42)\n```\n").unwrap();
        let raw = format!("@{}", file.path().display());

        let plain = args(&[raw.as_str()]);
        assert!(resolve_snippet(&plain).unwrap().starts_with("Here you go:"));

        let reply = args(&["--from-response", raw.as_str()]);
        assert_eq!(resolve_snippet(&reply).unwrap(), "print(42)");

        let prose = args(&["--from-response", "Nothing to run here."]);
        assert!(resolve_snippet(&prose).is_err());
    }

    #[test]
    fn test_collect_variables_last_wins() {
        let parsed = args(&["--var", "n=1", "--var", "n=2", "pass"]);
        let variables = collect_variables(&parsed).unwrap();
        assert_eq!(variables.get("n"), Some(&json!(2)));
    }
}
