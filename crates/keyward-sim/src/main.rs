mod scenario_common;
mod scenario_distribute;
mod scenario_files;
mod scenario_recover;
mod scenario_runner;
mod scenario_split;

use clap::{Parser, Subcommand};
use keyward_protocol::MAX_SHARES;
use scenario_common::{GroupShape, ScenarioResult};

#[derive(Parser)]
#[command(name = "keyward-sim", about = "In-process custody scenarios for Keyward")]
struct Cli {
    /// Number of stewards in the custody group.
    #[arg(long, default_value = "3")]
    stewards: usize,

    /// Shares needed to recover.
    #[arg(long, default_value = "2")]
    threshold: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split a secret and reconstruct it from every threshold subset.
    Split {
        /// Secret to split (UTF-8).
        #[arg(long, default_value = "K")]
        secret: String,
    },

    /// Distribute shards to live stewards, then redistribute after a content change.
    Distribute,

    /// Distribute, then recover with one steward denying.
    Recover,

    /// Blob upload, download confirmations and the 48h window.
    Files,

    /// Run every scenario and print an aggregated summary.
    All {
        #[arg(long, default_value = "K")]
        secret: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.threshold == 0 || cli.threshold > cli.stewards || cli.stewards > MAX_SHARES {
        anyhow::bail!(
            "need 1 <= threshold <= stewards <= {MAX_SHARES}, got {} of {}",
            cli.threshold,
            cli.stewards
        );
    }
    let shape = GroupShape {
        stewards: cli.stewards,
        threshold: cli.threshold,
    };

    eprintln!("keyward-sim v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Group: {} of {} stewards", shape.threshold, shape.stewards);

    let result = match cli.command {
        Command::Split { secret } => scenario_split::run(shape, secret.as_bytes())?,
        Command::Distribute => scenario_distribute::run(shape).await?,
        Command::Recover => scenario_recover::run(shape).await?,
        Command::Files => scenario_files::run(shape).await?,
        Command::All { secret } => {
            if !scenario_runner::run(shape, secret.as_bytes()).await {
                std::process::exit(1);
            }
            return Ok(());
        }
    };
    finish(result)
}

fn finish(result: ScenarioResult) -> anyhow::Result<()> {
    result.print_summary();
    result.emit_jsonl();
    if !result.success() {
        std::process::exit(1);
    }
    Ok(())
}
