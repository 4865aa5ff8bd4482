mod cli;

use clap::Parser;
use cli::{Cli, Commands, MigrateArgs};
use fetchfleet::config::Config;
use fetchfleet::observability::init_tracing;
use fetchfleet::storage::{FjallBackend, migrate};
use tracing::info;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let cli = Cli::parse();

    let config =
        Config::load_with_path(cli.config).map_err(|e| format!("Failed to load config: {}", e))?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Server(args) => fetchfleet::api::run(config, args.address).await?,
        Commands::Migrate(args) => run_migration(args).await?,
    }

    Ok(())
}

async fn run_migration(args: MigrateArgs) -> Result<(), AnyError> {
    if args.source == args.target {
        return Err("source and target must be different keyspaces".into());
    }

    info!(source = %args.source.display(), target = %args.target.display(), "Starting migration");
    let source = FjallBackend::open(&args.source)?;
    let target = FjallBackend::open(&args.target)?;

    let stats = migrate(&source, &target).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
