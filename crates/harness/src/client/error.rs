use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
    #[error("keystore unsealed but no auth cookie was set")]
    MissingAuthCookie,
}

impl ApiError {
    /// The node answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::HttpStatus(status, _) if *status == StatusCode::NOT_FOUND)
    }
}
