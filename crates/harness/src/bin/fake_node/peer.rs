use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use harness::client::types::{Project, RequestState};
use harness::node::SeedAddress;
use tokio::sync::watch;

use crate::state::ServiceState;

/// Endpoint other nodes fetch projects from.
pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/peer/projects/:urn", get(project))
        .with_state(state)
}

async fn project(
    State(state): State<ServiceState>,
    Path(urn): Path<String>,
) -> Result<Json<Project>, StatusCode> {
    state
        .data()
        .projects
        .get(&urn)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Resolve requested projects by asking every seed, until shutdown.
pub async fn sync_requests(
    state: ServiceState,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let (pending, seeds) = {
            let data = state.data();
            let pending: Vec<String> = data
                .requests
                .iter()
                .filter(|(_, request)| **request == RequestState::Requested)
                .map(|(urn, _)| urn.clone())
                .collect();
            let seeds: Vec<SocketAddr> = data
                .settings
                .seeds
                .iter()
                .filter_map(|seed| seed.parse::<SeedAddress>().ok())
                .map(|seed| seed.addr)
                .collect();
            (pending, seeds)
        };

        for urn in pending {
            for addr in &seeds {
                let Some(project) = fetch(&state, *addr, &urn).await else {
                    continue;
                };

                tracing::info!(%urn, seed = %addr, "project cloned");
                let mut data = state.data();
                data.projects.insert(urn.clone(), project);
                data.requests.insert(urn.clone(), RequestState::Cloned);
                break;
            }
        }
    }
}

async fn fetch(state: &ServiceState, addr: SocketAddr, urn: &str) -> Option<Project> {
    let url = format!("http://{}/peer/projects/{}", addr, urn);
    match state.http().get(&url).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(project) => Some(project),
            Err(e) => {
                tracing::warn!(%url, error = %e, "malformed project");
                None
            }
        },
        Ok(response) => {
            tracing::trace!(%url, status = %response.status(), "seed does not have project");
            None
        }
        Err(e) => {
            tracing::debug!(%url, error = %e, "seed unreachable");
            None
        }
    }
}
