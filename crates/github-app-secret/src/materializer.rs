use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, warn};

use crate::kind::{DesiredSecret, SecretFields, SecretKind};
use crate::store::{SecretKey, SecretStore, StoreError};

/// Times the read-modify-write cycle is restarted after a conflict.
const CONFLICT_RETRIES: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("invalid secret key: {0}")]
    InvalidKey(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the upsert did to the target Secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpsertOutcome::Created => "created",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        })
    }
}

/// Writes a token into a Secret in the format selected by [`SecretKind`].
pub struct SecretMaterializer<S> {
    store: S,
}

impl<S: SecretStore + Sync> SecretMaterializer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create the Secret if absent, otherwise merge the kind's labels and
    /// fields into it. Labels and keys the kind does not own are preserved.
    ///
    /// No write happens when the Secret already holds the desired values.
    pub async fn create_or_update(
        &self,
        key: &SecretKey,
        kind: SecretKind,
        token: &str,
        fields: &SecretFields,
    ) -> Result<UpsertOutcome, MaterializeError> {
        if key.namespace.is_empty() {
            return Err(MaterializeError::InvalidKey("namespace must not be empty"));
        }
        if key.name.is_empty() {
            return Err(MaterializeError::InvalidKey("name must not be empty"));
        }

        let desired = kind.desired(token, fields);
        let mut attempt = 0;
        loop {
            match self.try_upsert(key, &desired).await {
                Err(MaterializeError::Store(err))
                    if err.is_retryable() && attempt < CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    warn!(secret = %key, error = %err, attempt, "write conflict, retrying");
                }
                res => return res,
            }
        }
    }

    async fn try_upsert(
        &self,
        key: &SecretKey,
        desired: &DesiredSecret,
    ) -> Result<UpsertOutcome, MaterializeError> {
        let Some(existing) = self.store.get(key).await? else {
            self.store.create(key, desired).await?;
            info!(secret = %key, "created secret");
            return Ok(UpsertOutcome::Created);
        };

        if is_satisfied(&existing, desired) {
            debug!(secret = %key, "secret already up to date");
            return Ok(UpsertOutcome::Unchanged);
        }

        self.store
            .patch(key, desired, existing.metadata.resource_version.as_deref())
            .await?;
        info!(secret = %key, "updated secret");
        Ok(UpsertOutcome::Updated)
    }
}

/// Whether `secret` already carries every label and field in `desired`.
///
/// Stored values are read from `data`; `stringData` is only consulted for
/// objects that were never round-tripped through the API server.
fn is_satisfied(secret: &Secret, desired: &DesiredSecret) -> bool {
    let labels_match = desired.labels.iter().all(|(k, v)| {
        secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(k))
            == Some(v)
    });

    let fields_match = desired.string_data.iter().all(|(k, v)| {
        let stored = secret
            .data
            .as_ref()
            .and_then(|data| data.get(k))
            .map(|bytes| bytes.0.as_slice())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|sd| sd.get(k))
                    .map(String::as_bytes)
            });
        stored == Some(v.as_bytes())
    });

    labels_match && fields_match
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;

    use super::*;

    fn desired() -> DesiredSecret {
        SecretKind::ArgoCd.desired(
            "tok",
            &SecretFields {
                argocd_url: "https://example.com/repo.git".into(),
                ..Default::default()
            },
        )
    }

    fn secret_with_data(pairs: &[(&str, &str)], labels: &[(&str, &str)]) -> Secret {
        let mut secret = Secret::default();
        secret.data = Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        );
        secret.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<BTreeMap<_, _>>(),
        );
        secret
    }

    #[test]
    fn satisfied_when_all_fields_and_labels_match() {
        let secret = secret_with_data(
            &[
                ("username", "x-access-token"),
                ("password", "tok"),
                ("type", "git"),
                ("url", "https://example.com/repo.git"),
                ("extra", "kept"),
            ],
            &[
                ("argocd.argoproj.io/secret-type", "repository"),
                ("team", "infra"),
            ],
        );
        assert!(is_satisfied(&secret, &desired()));
    }

    #[test]
    fn not_satisfied_when_label_missing() {
        let secret = secret_with_data(
            &[
                ("username", "x-access-token"),
                ("password", "tok"),
                ("type", "git"),
                ("url", "https://example.com/repo.git"),
            ],
            &[],
        );
        assert!(!is_satisfied(&secret, &desired()));
    }

    #[test]
    fn not_satisfied_when_token_differs() {
        let secret = secret_with_data(
            &[
                ("username", "x-access-token"),
                ("password", "old"),
                ("type", "git"),
                ("url", "https://example.com/repo.git"),
            ],
            &[("argocd.argoproj.io/secret-type", "repository")],
        );
        assert!(!is_satisfied(&secret, &desired()));
    }

    #[test]
    fn string_data_counts_when_data_absent() {
        let mut secret = Secret::default();
        secret.string_data = Some(BTreeMap::from([("token".to_owned(), "t".to_owned())]));
        let plain = SecretKind::Plain.desired("t", &SecretFields::default());
        assert!(is_satisfied(&secret, &plain));
    }

    #[test]
    fn outcome_display() {
        assert_eq!(UpsertOutcome::Created.to_string(), "created");
        assert_eq!(UpsertOutcome::Updated.to_string(), "updated");
        assert_eq!(UpsertOutcome::Unchanged.to_string(), "unchanged");
    }
}
