//! Open a scenario, start one auxiliary child and wait to be signalled.
//!
//! Prints `child=<pid>` and `root=<path>` once the exit handler is
//! installed, so a caller can interrupt it and check what was left behind.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use harness::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "scenario-hold")]
struct Cli {
    /// Directory the scenario root is created in
    #[arg(long)]
    scenario_parent: Option<PathBuf>,

    /// Seconds the auxiliary child sleeps for
    #[arg(long, default_value_t = 60)]
    child_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = HarnessConfig {
        scenario_parent: cli.scenario_parent,
        forward_output: false,
        ..HarnessConfig::default()
    };
    let network = NetworkHarness::new(config).await?;

    let child = ProcessHandle::new(
        ProcessSpec::new("sleep")
            .arg(cli.child_secs.to_string())
            .forward_output(false),
        network.registry().clone(),
    );
    let running = child.start()?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "child={}", running.pid())?;
    writeln!(stdout, "root={}", network.root().display())?;
    stdout.flush()?;
    drop(stdout);

    // Only a signal ends this
    running.wait().await?;
    std::future::pending::<()>().await;
    Ok(())
}
