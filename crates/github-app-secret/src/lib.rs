//! Mint GitHub App installation tokens and store them in Kubernetes Secrets
//! as Git credentials, a plain token, or ArgoCD repository credentials.

pub mod app_secret;
pub mod kind;
pub mod materializer;
pub mod store;
pub mod token;

pub use app_secret::{AppSecret, Error};
pub use kind::{DesiredSecret, SecretFields, SecretKind, UnknownSecretKind};
pub use materializer::{MaterializeError, SecretMaterializer, UpsertOutcome};
pub use store::{KubeSecretStore, MemorySecretStore, SecretKey, SecretStore, StoreError};
pub use token::{GithubAppTokenProvider, InstallationToken, TokenError, TokenProvider, TokenRequest};
