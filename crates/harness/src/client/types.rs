//! Wire types of the control API and the requests that carry them.

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ApiError, ApiRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub peer_id: String,
    pub urn: String,
    pub handle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Seed addresses in `peerId@host:port` form
    #[serde(default)]
    pub seeds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub identity: Option<Identity>,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealRequest {
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIdentityRequest {
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub default_branch: String,
}

impl CreateProjectRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub urn: String,
    pub name: String,
    pub description: String,
    pub default_branch: String,
    /// Peer ids of the maintainers
    pub maintainers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestState {
    Requested,
    Cloned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRequest {
    pub urn: String,
    pub state: RequestState,
}

/// Build `base` + `/segments...`, percent-encoding each segment.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ApiError::UrlParse(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .clear()
        .extend(segments);
    Ok(url)
}

pub struct GetSession;

impl ApiRequest for GetSession {
    type Response = Session;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client.get(endpoint(base_url, &["v1", "session"])?))
    }
}

pub struct GetSettings;

impl ApiRequest for GetSettings {
    type Response = Settings;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client.get(endpoint(base_url, &["v1", "session", "settings"])?))
    }
}

pub struct UpdateSettings(pub Settings);

impl ApiRequest for UpdateSettings {
    type Response = Settings;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client
            .post(endpoint(base_url, &["v1", "session", "settings"])?)
            .json(&self.0))
    }
}

impl ApiRequest for CreateIdentityRequest {
    type Response = Identity;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client
            .post(endpoint(base_url, &["v1", "identities"])?)
            .json(&self))
    }
}

impl ApiRequest for CreateProjectRequest {
    type Response = Project;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client
            .post(endpoint(base_url, &["v1", "projects"])?)
            .json(&self))
    }
}

pub struct GetProject {
    pub urn: String,
}

impl ApiRequest for GetProject {
    type Response = Project;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client.get(endpoint(base_url, &["v1", "projects", &self.urn])?))
    }
}

pub struct RequestProject {
    pub urn: String,
}

impl ApiRequest for RequestProject {
    type Response = ProjectRequest;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError> {
        Ok(client.put(endpoint(base_url, &["v1", "projects", "requests", &self.urn])?))
    }
}
