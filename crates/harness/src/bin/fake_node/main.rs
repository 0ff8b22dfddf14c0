//! In-memory stand-in for the backend node binary.
//!
//! Speaks the same launch contract, control API and init/agent
//! conventions as the real backend, so the harness can be exercised end
//! to end without it.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod api;
mod peer;
mod state;
mod tools;

#[derive(Debug, Parser)]
#[command(name = "fake-node", args_conflicts_with_subcommands = true)]
struct Cli {
    /// Environment variable holding the home directory
    #[arg(long, global = true, default_value = "PEER_HOME")]
    home_env: String,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an identity in the home directory and print it as JSON
    Init(tools::InitArgs),
    /// Serve a signing agent socket until killed
    Agent(tools::AgentArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Control API listen address
    #[arg(long)]
    pub http_listen: Option<SocketAddr>,
    /// Peer protocol listen address
    #[arg(long)]
    pub peer_listen: Option<SocketAddr>,
    #[arg(long)]
    pub key_passphrase: Option<String>,
    /// `peerId@host:port`, repeatable
    #[arg(long = "seed")]
    pub seeds: Vec<String>,
    #[arg(long)]
    pub unsafe_fast_keystore: bool,
    #[arg(long)]
    pub skip_remote_helper_install: bool,
    /// How often requested projects are looked up on seeds
    #[arg(long, default_value_t = 100)]
    pub sync_interval_ms: u64,
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    // stdout is reserved for the init descriptor
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(layer).init();
    guard
}

fn home_dir(var: &str) -> anyhow::Result<PathBuf> {
    std::env::var_os(var)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("{} is not set", var))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging();

    match cli.command {
        Some(Command::Init(args)) => tools::init(&home_dir(&cli.home_env)?, args),
        Some(Command::Agent(args)) => tools::agent(args).await,
        None => state::run(home_dir(&cli.home_env)?, cli.run).await,
    }
}
