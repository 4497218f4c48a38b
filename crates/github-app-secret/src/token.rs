use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use jsonwebtoken::EncodingKey;
use octocrab::Octocrab;
use octocrab::models::AppId;
use serde::Deserialize;
use tracing::debug;
use url::Url;

/// Public GitHub API endpoint used when no override is configured.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token request: {0}")]
    InvalidRequest(String),
    #[error("failed to read private key {path}: {source}")]
    ReadKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid private key {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("installation token exchange failed: {0}")]
    Exchange(String),
    #[error("GitHub API returned an empty installation token")]
    EmptyToken,
}

impl From<octocrab::Error> for TokenError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => TokenError::Api {
                status: source.status_code.as_u16(),
                message: source.message,
            },
            // Display of the remaining variants appends a backtrace; keep the
            // first line only so the error logs as a single line.
            other => TokenError::Exchange(
                other.to_string().lines().next().unwrap_or_default().to_owned(),
            ),
        }
    }
}

/// Everything needed to mint one installation token.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    /// Alternate API base, e.g. `https://ghe.example.com/api/v3`.
    pub api_url: Option<Url>,
    pub app_id: u64,
    pub installation_id: u64,
    pub private_key_path: PathBuf,
}

impl TokenRequest {
    fn validate(&self) -> Result<(), TokenError> {
        if self.app_id == 0 {
            return Err(TokenError::InvalidRequest("app ID must be nonzero".into()));
        }
        if self.installation_id == 0 {
            return Err(TokenError::InvalidRequest(
                "installation ID must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// A short-lived installation access token.
#[derive(Clone, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of installation tokens.
pub trait TokenProvider {
    fn issue_token(
        &self,
        request: &TokenRequest,
    ) -> impl Future<Output = Result<InstallationToken, TokenError>> + Send;
}

/// [`TokenProvider`] that signs an app JWT with the private key and exchanges
/// it for an installation token through the GitHub REST API.
#[derive(Debug, Clone, Default)]
pub struct GithubAppTokenProvider;

impl GithubAppTokenProvider {
    pub fn new() -> Self {
        Self
    }

    fn client(request: &TokenRequest, key: EncodingKey) -> Result<Octocrab, TokenError> {
        let mut builder = Octocrab::builder().app(AppId(request.app_id), key);
        if let Some(api_url) = &request.api_url {
            builder = builder.base_uri(api_url.as_str().trim_end_matches('/'))?;
        }
        Ok(builder.build()?)
    }
}

impl TokenProvider for GithubAppTokenProvider {
    async fn issue_token(&self, request: &TokenRequest) -> Result<InstallationToken, TokenError> {
        request.validate()?;

        let pem = tokio::fs::read(&request.private_key_path)
            .await
            .map_err(|source| TokenError::ReadKey {
                path: request.private_key_path.clone(),
                source,
            })?;
        let key = EncodingKey::from_rsa_pem(&pem).map_err(|source| TokenError::InvalidKey {
            path: request.private_key_path.clone(),
            source,
        })?;

        let github = Self::client(request, key)?;
        let installation = request.installation_id;
        let api = request
            .api_url
            .as_ref()
            .map_or(DEFAULT_API_URL, |u| u.as_str());
        debug!(app_id = request.app_id, %installation, %api, "requesting installation token");

        let token: InstallationToken = github
            .post(
                format!("/app/installations/{installation}/access_tokens"),
                None::<&()>,
            )
            .await?;
        if token.token.is_empty() {
            return Err(TokenError::EmptyToken);
        }

        debug!(expires_at = ?token.expires_at, "installation token issued");
        Ok(token)
    }
}
