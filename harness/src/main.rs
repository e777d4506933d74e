use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_harness::{config, demo, migrate, run};

#[derive(Parser, Debug)]
#[command(name = "relay-harness")]
#[command(about = "Runnable harness for the relay work-queue substrate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run `harness/migrations` against the configured database.
    Migrate,

    /// Start the Outbox/Inbox/Scheduler/Fanout dispatch loops and block
    /// until `ctrl_c`.
    Run,

    /// Seed a message, timer, job, and fanout policy for manual smoke
    /// testing of a running `run` process.
    DemoEnqueue {
        /// Store to route the demo message into when STORE_URLS configures
        /// more than one store. Ignored otherwise.
        #[arg(long, default_value = "primary")]
        routing_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Run => run::run(&cfg).await,
        Command::DemoEnqueue { routing_key } => demo::run(&cfg, &routing_key).await,
    }
}
