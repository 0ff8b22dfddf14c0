use axum::extract::{Json, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use harness::client::types::{
    CreateIdentityRequest, CreateProjectRequest, Identity, Project, ProjectRequest, RequestState,
    Session, Settings, UnsealRequest,
};
use harness::client::AUTH_COOKIE;
use harness::node::SeedAddress;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::state::{ServiceState, StoredIdentity};

pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/keystore/unseal", post(unseal))
        .route("/v1/session", get(session))
        .route("/v1/session/settings", get(settings).post(update_settings))
        .route("/v1/identities", post(create_identity))
        .route("/v1/projects", post(create_project))
        .route("/v1/projects/:urn", get(project))
        .route("/v1/projects/requests/:urn", put(request_project))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("missing or invalid auth cookie")]
    Unauthorized,
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("node has no identity yet")]
    NoIdentity,
    #[error("identity already exists")]
    IdentityExists,
    #[error("project {0} not found")]
    ProjectNotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = match &self {
            HandlerError::Unauthorized => StatusCode::UNAUTHORIZED,
            HandlerError::WrongPassphrase => StatusCode::FORBIDDEN,
            HandlerError::NoIdentity | HandlerError::Invalid(_) => StatusCode::BAD_REQUEST,
            HandlerError::IdentityExists => StatusCode::CONFLICT,
            HandlerError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            HandlerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

fn authorize(state: &ServiceState, headers: &HeaderMap) -> Result<(), HandlerError> {
    let authorized = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == AUTH_COOKIE && value == state.token());

    if authorized {
        Ok(())
    } else {
        Err(HandlerError::Unauthorized)
    }
}

async fn unseal(
    State(state): State<ServiceState>,
    Json(req): Json<UnsealRequest>,
) -> Result<Response, HandlerError> {
    if req.passphrase != state.passphrase() {
        return Err(HandlerError::WrongPassphrase);
    }

    let cookie = format!("{}={}; Path=/; HttpOnly", AUTH_COOKIE, state.token());
    Ok(([(header::SET_COOKIE, cookie)], Json(serde_json::json!({}))).into_response())
}

async fn session(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Session>, HandlerError> {
    authorize(&state, &headers)?;
    let data = state.data();
    Ok(Json(Session {
        identity: data.identity.clone(),
        settings: data.settings.clone(),
    }))
}

async fn settings(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Settings>, HandlerError> {
    authorize(&state, &headers)?;
    Ok(Json(state.data().settings.clone()))
}

async fn update_settings(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(req): Json<Settings>,
) -> Result<Json<Settings>, HandlerError> {
    authorize(&state, &headers)?;
    for seed in &req.seeds {
        seed.parse::<SeedAddress>()
            .map_err(|e| HandlerError::Invalid(e.to_string()))?;
    }

    tracing::info!(seeds = ?req.seeds, "settings updated");
    state.data().settings = req.clone();
    Ok(Json(req))
}

async fn create_identity(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(req): Json<CreateIdentityRequest>,
) -> Result<(StatusCode, Json<Identity>), HandlerError> {
    authorize(&state, &headers)?;
    if req.handle.is_empty() {
        return Err(HandlerError::Invalid("handle cannot be empty".into()));
    }
    if state.data().identity.is_some() {
        return Err(HandlerError::IdentityExists);
    }

    let stored = StoredIdentity::generate(&req.handle, state.passphrase());
    stored.save(state.home())?;
    tracing::info!(peer_id = %stored.identity.peer_id, "identity created");

    state.data().identity = Some(stored.identity.clone());
    Ok((StatusCode::CREATED, Json(stored.identity)))
}

async fn create_project(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), HandlerError> {
    authorize(&state, &headers)?;
    if req.name.is_empty() {
        return Err(HandlerError::Invalid("project name cannot be empty".into()));
    }

    let mut data = state.data();
    let owner = data.identity.as_ref().ok_or(HandlerError::NoIdentity)?;
    let project = Project {
        urn: format!("urn:peer:proj:{}", Uuid::new_v4().simple()),
        name: req.name,
        description: req.description,
        default_branch: req.default_branch,
        maintainers: vec![owner.peer_id.clone()],
    };

    tracing::info!(urn = %project.urn, name = %project.name, "project created");
    data.projects.insert(project.urn.clone(), project.clone());
    Ok((StatusCode::CREATED, Json(project)))
}

async fn project(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(urn): Path<String>,
) -> Result<Json<Project>, HandlerError> {
    authorize(&state, &headers)?;
    state
        .data()
        .projects
        .get(&urn)
        .cloned()
        .map(Json)
        .ok_or(HandlerError::ProjectNotFound(urn))
}

async fn request_project(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(urn): Path<String>,
) -> Result<Json<ProjectRequest>, HandlerError> {
    authorize(&state, &headers)?;

    let mut data = state.data();
    let request_state = if data.projects.contains_key(&urn) {
        RequestState::Cloned
    } else {
        *data
            .requests
            .entry(urn.clone())
            .or_insert(RequestState::Requested)
    };

    tracing::info!(%urn, state = ?request_state, "project requested");
    Ok(Json(ProjectRequest {
        urn,
        state: request_state,
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
