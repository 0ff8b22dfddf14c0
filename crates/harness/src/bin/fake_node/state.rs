use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use harness::client::types::{Identity, Project, RequestState, Settings};
use harness::node::SeedAddress;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{api, peer, RunArgs};

const IDENTITY_FILE: &str = "identity.json";

/// Identity and key passphrase as kept in the home directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub identity: Identity,
    pub passphrase: String,
}

impl StoredIdentity {
    pub fn generate(handle: &str, passphrase: &str) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            identity: Identity {
                peer_id: format!("hyb{}", &id[..16]),
                urn: format!("urn:peer:ident:{}", id),
                handle: handle.to_string(),
            },
            passphrase: passphrase.to_string(),
        }
    }

    fn path(home: &Path) -> PathBuf {
        home.join(IDENTITY_FILE)
    }

    pub fn exists(home: &Path) -> bool {
        Self::path(home).exists()
    }

    pub fn load(home: &Path) -> anyhow::Result<Option<Self>> {
        match std::fs::read(Self::path(home)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, home: &Path) -> anyhow::Result<()> {
        std::fs::write(Self::path(home), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NodeData {
    pub identity: Option<Identity>,
    pub settings: Settings,
    pub projects: HashMap<String, Project>,
    pub requests: HashMap<String, RequestState>,
}

struct Inner {
    home: PathBuf,
    passphrase: String,
    token: String,
    data: Mutex<NodeData>,
    http: reqwest::Client,
}

#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<Inner>,
}

impl ServiceState {
    pub fn new(
        home: PathBuf,
        passphrase: String,
        identity: Option<Identity>,
        seeds: Vec<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                home,
                passphrase,
                token: Uuid::new_v4().simple().to_string(),
                data: Mutex::new(NodeData {
                    identity,
                    settings: Settings { seeds },
                    ..NodeData::default()
                }),
                http,
            }),
        })
    }

    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    pub fn passphrase(&self) -> &str {
        &self.inner.passphrase
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Never hold the guard across an await.
    pub fn data(&self) -> MutexGuard<'_, NodeData> {
        self.inner.data.lock()
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }
}

/// Serve the control API and the peer endpoint until interrupted.
pub async fn run(home: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let http_listen = args
        .http_listen
        .ok_or_else(|| anyhow::anyhow!("--http-listen is required"))?;
    let peer_listen = args
        .peer_listen
        .ok_or_else(|| anyhow::anyhow!("--peer-listen is required"))?;
    let passphrase = args
        .key_passphrase
        .ok_or_else(|| anyhow::anyhow!("--key-passphrase is required"))?;

    for seed in &args.seeds {
        seed.parse::<SeedAddress>()?;
    }

    std::fs::create_dir_all(&home)?;
    let stored = StoredIdentity::load(&home)?;
    if let Some(stored) = &stored {
        if stored.passphrase != passphrase {
            anyhow::bail!("key passphrase does not unlock {}", home.display());
        }
    }

    let state = ServiceState::new(
        home,
        passphrase,
        stored.map(|stored| stored.identity),
        args.seeds,
    )?;

    // Bind before spawning so a taken port fails the launch
    let api_listener = TcpListener::bind(http_listen).await?;
    let peer_listener = TcpListener::bind(peer_listen).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_tx.send(());
    });

    let sync = tokio::spawn(peer::sync_requests(
        state.clone(),
        Duration::from_millis(args.sync_interval_ms),
        shutdown_rx.clone(),
    ));

    tracing::info!(
        api = %http_listen,
        peer = %peer_listen,
        fast_keystore = args.unsafe_fast_keystore,
        remote_helper = !args.skip_remote_helper_install,
        "node listening"
    );

    let (api_result, peer_result) = tokio::join!(
        serve(api_listener, api::router(state.clone()), shutdown_rx.clone()),
        serve(peer_listener, peer::router(state), shutdown_rx),
    );
    api_result?;
    peer_result?;
    sync.await?;

    tracing::info!("node shut down");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
}
