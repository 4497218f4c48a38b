use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use github_app_secret::{SecretFields, SecretKey, SecretKind, TokenRequest, UnknownSecretKind};
use url::Url;

/// Namespace used when neither `--secretNamespace` nor `NAMESPACE` is set.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Environment variable the downward API injects the pod namespace into.
pub const NAMESPACE_ENV: &str = "NAMESPACE";

#[derive(Parser, Debug)]
#[command(
    name = "github-app-secret",
    version,
    args_override_self = true,
    about = "Generate a GitHub App installation token and store it in a Kubernetes Secret"
)]
pub struct Cli {
    /// Log verbosity level (0 = info, 1 = debug, 2+ = trace).
    #[arg(short = 'v', long = "logLevel", default_value_t = 0)]
    pub log_level: u8,

    /// GitHub API URL (default "https://api.github.com").
    #[arg(long = "apiURL", env = "GITHUB_API_URL")]
    pub api_url: Option<String>,

    /// GitHub App ID.
    #[arg(long = "appID", env = "GITHUB_APP_ID", default_value_t = 0)]
    pub app_id: u64,

    /// GitHub App Installation ID.
    #[arg(long = "installationID", env = "GITHUB_INSTALLATION_ID", default_value_t = 0)]
    pub installation_id: u64,

    /// Path to the GitHub App private key.
    #[arg(long = "privateKeyPath", env = "GITHUB_PRIVATE_KEY_PATH", default_value = "")]
    pub private_key_path: String,

    /// Type of secret to create [git, plain, argocd, argocd-template].
    #[arg(long = "secretType", env = "GITHUB_APP_SECRET_TYPE", default_value = "git")]
    pub secret_type: String,

    /// Timeout for token generation and secret creation.
    #[arg(
        long = "timeout",
        env = "GITHUB_APP_SECRET_TIMEOUT",
        default_value = "15s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// Name of the Secret to store the token in.
    #[arg(long = "secretName", env = "GITHUB_APP_SECRET_NAME", default_value = "")]
    pub secret_name: String,

    /// Namespace of the Secret (default: $NAMESPACE, else "default").
    #[arg(long = "secretNamespace")]
    pub secret_namespace: Option<String>,

    /// ArgoCD repository credentials type.
    #[arg(long = "argocdType", env = "GITHUB_APP_SECRET_ARGOCD_TYPE", default_value = "git")]
    pub argocd_type: String,

    /// ArgoCD repository credentials URL.
    #[arg(long = "argocdURL", env = "GITHUB_APP_SECRET_ARGOCD_URL", default_value = "")]
    pub argocd_url: String,

    /// Username field value in the Secret.
    #[arg(
        long = "username",
        env = "GITHUB_APP_SECRET_USERNAME",
        default_value = github_app_secret::kind::DEFAULT_USERNAME
    )]
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid API URL {url:?}: {source}")]
    InvalidApiUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid GitHub App ID: {0}")]
    InvalidAppId(u64),
    #[error("invalid GitHub App Installation ID: {0}")]
    InvalidInstallationId(u64),
    #[error("must provide a private key path with --privateKeyPath")]
    MissingPrivateKeyPath,
    #[error("must provide a Secret name with --secretName")]
    MissingSecretName,
    #[error(transparent)]
    UnknownSecretType(#[from] UnknownSecretKind),
    #[error("ArgoCD Secret types require a repository credentials type, set with --argocdType")]
    MissingArgocdType,
    #[error("ArgoCD Secret types require a URL, set with --argocdURL")]
    MissingArgocdUrl,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub request: TokenRequest,
    pub key: SecretKey,
    pub kind: SecretKind,
    pub fields: SecretFields,
    pub timeout: Duration,
}

impl Cli {
    /// Check every flag and resolve defaults. Runs before any network call.
    ///
    /// `env_namespace` is the value of `NAMESPACE`, passed in so tests do not
    /// depend on the process environment.
    pub fn validate(self, env_namespace: Option<String>) -> Result<Settings, ConfigError> {
        let api_url = match self.api_url.as_deref().filter(|u| !u.is_empty()) {
            Some(raw) => Some(Url::parse(raw).map_err(|source| ConfigError::InvalidApiUrl {
                url: raw.to_owned(),
                source,
            })?),
            None => None,
        };

        if self.app_id == 0 {
            return Err(ConfigError::InvalidAppId(self.app_id));
        }
        if self.installation_id == 0 {
            return Err(ConfigError::InvalidInstallationId(self.installation_id));
        }
        if self.private_key_path.is_empty() {
            return Err(ConfigError::MissingPrivateKeyPath);
        }
        if self.secret_name.is_empty() {
            return Err(ConfigError::MissingSecretName);
        }

        let kind: SecretKind = self.secret_type.parse()?;
        if kind.is_argocd() {
            if self.argocd_type.is_empty() {
                return Err(ConfigError::MissingArgocdType);
            }
            if self.argocd_url.is_empty() {
                return Err(ConfigError::MissingArgocdUrl);
            }
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(Settings {
            request: TokenRequest {
                api_url,
                app_id: self.app_id,
                installation_id: self.installation_id,
                private_key_path: PathBuf::from(self.private_key_path),
            },
            key: SecretKey::new(
                resolve_namespace(self.secret_namespace, env_namespace),
                self.secret_name,
            ),
            kind,
            fields: SecretFields {
                username: self.username,
                argocd_type: self.argocd_type,
                argocd_url: self.argocd_url,
            },
            timeout: self.timeout,
        })
    }
}

/// Flag wins over the downward-API namespace, which wins over "default".
/// Empty values count as unset.
pub fn resolve_namespace(flag: Option<String>, env: Option<String>) -> String {
    flag.filter(|ns| !ns.is_empty())
        .or_else(|| env.filter(|ns| !ns.is_empty()))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned())
}

/// Read the pod namespace injected through the downward API.
pub fn namespace_from_env() -> Option<String> {
    std::env::var(NAMESPACE_ENV).ok()
}
