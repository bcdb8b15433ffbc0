//! berth - single-host declarative workload coordinator.

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod context;

#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(version, about = "Single-host declarative workload coordinator")]
struct Cli {
    /// Log everything that may be logged.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Log only warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the host and database. Run as root.
    Init,

    /// Add or override secrets from a JSON file of key/value pairs.
    SetSecrets {
        /// Path to the JSON secrets file.
        path: std::path::PathBuf,
    },

    /// Calculate the actions needed to bring the host to its desired state.
    Diff,

    /// Bring the host to its desired state and report the actions taken.
    Sync,

    /// Start the HTTPS management API.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage problems exit 1, matching the rest of the tooling here.
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let (cloudwatch_tx, mut cloudwatch_rx) = tokio::sync::mpsc::unbounded_channel();
    init_logging(&cli, cloudwatch_tx);

    // Only `serve` can ship logs to CloudWatch; close the mirror channel
    // everywhere else so the layer's sends fail fast instead of queueing.
    if !matches!(cli.command, Commands::Serve) {
        cloudwatch_rx.close();
    }

    let outcome = match cli.command {
        Commands::Init => commands::init::run().await,
        Commands::SetSecrets { ref path } => commands::secrets::run(path).await,
        Commands::Diff => commands::diff::run().await,
        Commands::Sync => commands::sync::run().await,
        Commands::Serve => commands::serve::run(cloudwatch_rx).await,
    };

    if let Err(err) = outcome {
        tracing::error!(error = %err, "Command failed.");
        std::process::exit(1);
    }
}

/// Install the log subscriber: stderr formatting filtered by the verbosity
/// flags, plus the CloudWatch mirror layer. The mirror stays inert unless
/// `serve` finds a log group configured and starts the shipper.
fn init_logging(cli: &Cli, cloudwatch_tx: tokio::sync::mpsc::UnboundedSender<berth_api::telemetry::LogLine>) {
    let default_level = if cli.verbose {
        "trace"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(berth_api::telemetry::CloudWatchLayer::new(cloudwatch_tx))
        .init();
}
