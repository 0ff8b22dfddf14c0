mod error;
pub mod types;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use url::Url;

pub use error::ApiError;
use types::*;

pub const AUTH_COOKIE: &str = "auth-cookie";

/// A request against the control API.
///
/// Each request struct knows its route; the client only sends it.
pub trait ApiRequest {
    type Response: DeserializeOwned;

    fn build_request(self, base_url: &Url, client: &Client) -> Result<RequestBuilder, ApiError>;
}

/// Client for one node's control API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    pub remote: Url,
    client: Client,
    auth_token: Option<String>,
}

impl ApiClient {
    pub fn new(remote: &Url) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn base_url(&self) -> &Url {
        &self.remote
    }

    pub async fn call<T: ApiRequest>(&self, request: T) -> Result<T::Response, ApiError> {
        let mut request_builder = request.build_request(&self.remote, &self.client)?;
        if let Some(token) = &self.auth_token {
            request_builder = request_builder.header(COOKIE, format!("{}={}", AUTH_COOKIE, token));
        }

        let response = request_builder.send().await?;

        if response.status().is_success() {
            Ok(response.json::<T::Response>().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }

    /// Unlock the keystore and remember the auth token the node hands out.
    pub async fn unseal(&mut self, passphrase: &str) -> Result<String, ApiError> {
        let url = self.remote.join("/v1/keystore/unseal")?;
        let response = self
            .client
            .post(url)
            .json(&UnsealRequest {
                passphrase: passphrase.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ));
        }

        let token = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(parse_auth_cookie)
            .ok_or(ApiError::MissingAuthCookie)?;

        self.auth_token = Some(token.clone());
        Ok(token)
    }

    pub async fn session(&self) -> Result<Session, ApiError> {
        self.call(GetSession).await
    }

    pub async fn settings(&self) -> Result<Settings, ApiError> {
        self.call(GetSettings).await
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, ApiError> {
        self.call(UpdateSettings(settings)).await
    }

    pub async fn create_identity(&self, handle: &str) -> Result<Identity, ApiError> {
        self.call(CreateIdentityRequest {
            handle: handle.to_string(),
        })
        .await
    }

    pub async fn create_project(&self, request: CreateProjectRequest) -> Result<Project, ApiError> {
        self.call(request).await
    }

    pub async fn project(&self, urn: &str) -> Result<Project, ApiError> {
        self.call(GetProject {
            urn: urn.to_string(),
        })
        .await
    }

    /// Ask the network for a project this node does not have yet.
    pub async fn request_project(&self, urn: &str) -> Result<ProjectRequest, ApiError> {
        self.call(RequestProject {
            urn: urn.to_string(),
        })
        .await
    }
}

/// Extract the token from a `Set-Cookie: auth-cookie=<token>; ...` value.
fn parse_auth_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name == AUTH_COOKIE && !value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_cookie() {
        assert_eq!(
            parse_auth_cookie("auth-cookie=abc123; Path=/; HttpOnly"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_auth_cookie("auth-cookie=xyz"), Some("xyz".to_string()));
        assert_eq!(parse_auth_cookie("other=abc; Path=/"), None);
        assert_eq!(parse_auth_cookie("auth-cookie=; Path=/"), None);
        assert_eq!(parse_auth_cookie("garbage"), None);
    }

    #[test]
    fn test_auth_token_builder() {
        let url = Url::parse("http://127.0.0.1:8080").unwrap();
        let client = ApiClient::new(&url).unwrap();
        assert!(client.auth_token().is_none());

        let client = client.with_auth_token("token");
        assert_eq!(client.auth_token(), Some("token"));
        assert_eq!(client.base_url(), &url);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let client = ApiClient::new(&url).unwrap();
        assert!(matches!(client.session().await, Err(ApiError::Reqwest(_))));
    }
}
