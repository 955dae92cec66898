use clap::Parser;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use llm_metadata_compare::config::Config;
use llm_metadata_compare::output::{self, OutputFormat};
use llm_metadata_compare::runner::Runner;

/// Compare LLM-generated dataset descriptions side by side and judge them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML run file
    run_file: PathBuf,

    /// Output format: plain or json
    #[arg(short, long, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - log every stream and judge call
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_file(&args.run_file)?;
    let runner = Runner::new(config)?;

    let session = runner.session_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight generations");
            session.cancel();
        }
    });

    let report = runner.run().await?;

    output::print_report(&report, args.output);

    Ok(())
}
