use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "Merges partitioned event streams into time-ordered append-only logs", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the configured partitions and write them to the log destinations
    Run,
    /// Print the records of a written blob
    Inspect { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tributary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => {
            let config_path = tributary::config::resolve_config_path(cli.config.as_deref());
            tributary::cli::run::run(config_path).await?;
        }
        Some(Commands::Inspect { path }) => {
            tributary::cli::inspect::inspect(&path)?;
        }
    }

    Ok(())
}
