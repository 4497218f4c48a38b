use std::time::Duration;

use tracing::{debug, info};

use crate::kind::{SecretFields, SecretKind};
use crate::materializer::{MaterializeError, SecretMaterializer, UpsertOutcome};
use crate::store::{SecretKey, SecretStore};
use crate::token::{TokenError, TokenProvider, TokenRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token generation failed: {0}")]
    Token(#[from] TokenError),
    #[error("secret write failed: {0}")]
    Secret(#[from] MaterializeError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Generates an installation token and stores it in a Secret.
pub struct AppSecret<P, S> {
    provider: P,
    materializer: SecretMaterializer<S>,
}

impl<P, S> AppSecret<P, S>
where
    P: TokenProvider + Sync,
    S: SecretStore + Sync,
{
    pub fn new(provider: P, store: S) -> Self {
        Self {
            provider,
            materializer: SecretMaterializer::new(store),
        }
    }

    pub fn materializer(&self) -> &SecretMaterializer<S> {
        &self.materializer
    }

    /// Issue a token and upsert it into `key`, both within `timeout`.
    ///
    /// Nothing is rolled back when the deadline hits after the token was
    /// issued; rerunning is safe because the upsert is idempotent.
    pub async fn generate_and_store(
        &self,
        request: &TokenRequest,
        key: &SecretKey,
        kind: SecretKind,
        fields: &SecretFields,
        timeout: Duration,
    ) -> Result<UpsertOutcome, Error> {
        let run = async {
            let token = self.provider.issue_token(request).await?;
            debug!(secret = %key, %kind, "token generated, writing secret");
            let outcome = self
                .materializer
                .create_or_update(key, kind, &token.token, fields)
                .await?;
            Ok::<_, Error>(outcome)
        };

        let outcome = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        info!(secret = %key, %kind, %outcome, "token generated and secret stored");
        Ok(outcome)
    }
}
