pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "peer-net")]
#[command(about = "Boot and inspect local networks of backend nodes")]
pub struct Args {
    /// Harness config file (TOML); `PEER_HARNESS_*` variables still apply
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Default log level, `RUST_LOG` takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: crate::Command,
}
