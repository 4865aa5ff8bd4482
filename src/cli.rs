use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchfleet")]
#[command(about = "Download-job dispatcher for a fleet of download workers", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides FETCHFLEET_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatcher HTTP API and supervisor
    Server(ServerArgs),
    /// Copy every worker and task from one fjall keyspace into another
    Migrate(MigrateArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServerArgs {
    /// Address to bind the HTTP server to (defaults to server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct MigrateArgs {
    /// Source keyspace directory
    #[arg(long)]
    pub source: PathBuf,

    /// Target keyspace directory (created if missing)
    #[arg(long)]
    pub target: PathBuf,
}
