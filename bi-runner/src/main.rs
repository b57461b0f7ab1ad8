use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use bi_runner_lib::cli::CliArgs;

/// Logs go to stderr so snippet output on stdout stays clean.
/// `RUST_LOG` overrides the default `warn` level.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let args = CliArgs::parse();
    let succeeded = bi_runner_lib::run(args).await?;

    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
