use std::path::{Path, PathBuf};

use clap::Args;
use tokio::net::UnixListener;

use crate::state::StoredIdentity;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Handle of the new identity
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub passphrase: String,
}

#[derive(Debug, Args)]
pub struct AgentArgs {
    /// Where to create the agent socket
    #[arg(long)]
    pub socket: PathBuf,
}

/// Create key material in `home` and print `{"peerId", "urn"}` on stdout.
pub fn init(home: &Path, args: InitArgs) -> anyhow::Result<()> {
    if StoredIdentity::exists(home) {
        anyhow::bail!("identity already exists in {}", home.display());
    }

    std::fs::create_dir_all(home)?;
    tracing::info!(handle = %args.name, "generating key material");

    let stored = StoredIdentity::generate(&args.name, &args.passphrase);
    stored.save(home)?;

    println!(
        "{}",
        serde_json::json!({
            "peerId": stored.identity.peer_id,
            "urn": stored.identity.urn,
        })
    );
    Ok(())
}

/// Accept and drop connections on `socket` until killed.
pub async fn agent(args: AgentArgs) -> anyhow::Result<()> {
    let listener = UnixListener::bind(&args.socket)?;
    tracing::info!(socket = %args.socket.display(), "agent listening");

    loop {
        let (_stream, _) = listener.accept().await?;
        tracing::debug!("agent connection");
    }
}
