use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::kind::DesiredSecret;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "github-app-secret";

/// Identity of the target Secret.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretKey {
    pub namespace: String,
    pub name: String,
}

impl SecretKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Secret {key} was modified concurrently: {message}")]
    Conflict { key: String, message: String },
    #[error("Secret {key} not found")]
    NotFound { key: String },
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl StoreError {
    fn from_kube(key: &SecretKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) if status.code == 409 => StoreError::Conflict {
                key: key.to_string(),
                message: status.message.clone(),
            },
            kube::Error::Api(status) if status.code == 404 => StoreError::NotFound {
                key: key.to_string(),
            },
            other => StoreError::Kube(other),
        }
    }

    /// Whether the read-modify-write cycle should be restarted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::NotFound { .. })
    }
}

/// The three Secret operations the materializer needs from a cluster.
pub trait SecretStore {
    /// Fetch the Secret, `None` when it does not exist.
    fn get(
        &self,
        key: &SecretKey,
    ) -> impl Future<Output = Result<Option<Secret>, StoreError>> + Send;

    /// Create the Secret; fails with [`StoreError::Conflict`] if it already exists.
    fn create(
        &self,
        key: &SecretKey,
        desired: &DesiredSecret,
    ) -> impl Future<Output = Result<Secret, StoreError>> + Send;

    /// Merge `desired` into the existing Secret.
    ///
    /// When `resource_version` is set the write only succeeds if the stored
    /// object still carries that version.
    fn patch(
        &self,
        key: &SecretKey,
        desired: &DesiredSecret,
        resource_version: Option<&str>,
    ) -> impl Future<Output = Result<Secret, StoreError>> + Send;
}

/// [`SecretStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &SecretKey) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

impl SecretStore for KubeSecretStore {
    async fn get(&self, key: &SecretKey) -> Result<Option<Secret>, StoreError> {
        self.api(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(key, e))
    }

    async fn create(&self, key: &SecretKey, desired: &DesiredSecret) -> Result<Secret, StoreError> {
        let secret = new_secret(key, desired);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        debug!(secret = %key, "creating secret");
        self.api(key)
            .create(&pp, &secret)
            .await
            .map_err(|e| StoreError::from_kube(key, e))
    }

    async fn patch(
        &self,
        key: &SecretKey,
        desired: &DesiredSecret,
        resource_version: Option<&str>,
    ) -> Result<Secret, StoreError> {
        let patch = merge_patch(desired, resource_version);
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        debug!(secret = %key, ?resource_version, "patching secret");
        self.api(key)
            .patch(&key.name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(key, e))
    }
}

/// Fresh `Opaque` Secret carrying only what the kind defines.
pub fn new_secret(key: &SecretKey, desired: &DesiredSecret) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: (!desired.labels.is_empty()).then(|| desired.labels.clone()),
            ..Default::default()
        },
        string_data: Some(desired.string_data.clone()),
        type_: Some("Opaque".into()),
        ..Default::default()
    }
}

/// JSON merge patch touching only the kind's labels and `stringData` keys.
pub fn merge_patch(desired: &DesiredSecret, resource_version: Option<&str>) -> Value {
    let mut metadata = Map::new();
    if let Some(rv) = resource_version {
        metadata.insert("resourceVersion".into(), json!(rv));
    }
    if !desired.labels.is_empty() {
        metadata.insert("labels".into(), json!(desired.labels));
    }

    let mut patch = Map::new();
    if !metadata.is_empty() {
        patch.insert("metadata".into(), Value::Object(metadata));
    }
    patch.insert("stringData".into(), json!(desired.string_data));
    Value::Object(patch)
}

/// In-memory [`SecretStore`] that mimics the API server closely enough for
/// tests: `stringData` is folded into `data`, every write bumps
/// `resourceVersion`, stale versions and duplicate creates conflict.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<SecretKey, Secret>>,
    next_version: AtomicUsize,
    injected_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing Secret. Its `stringData` is folded into `data`.
    pub fn insert(&self, mut secret: Secret) {
        let key = SecretKey::new(
            secret.metadata.namespace.clone().unwrap_or_default(),
            secret.metadata.name.clone().unwrap_or_default(),
        );
        fold_string_data(&mut secret, None);
        secret.metadata.resource_version = Some(self.bump_version());
        self.lock().insert(key, secret);
    }

    /// Current stored state of a Secret.
    pub fn secret(&self, key: &SecretKey) -> Option<Secret> {
        self.lock().get(key).cloned()
    }

    /// Make the next `count` create/patch calls fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful create and patch calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SecretKey, Secret>> {
        self.secrets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self, key: &SecretKey) -> Result<(), StoreError> {
        let took = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                message: "injected conflict".into(),
            });
        }
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &SecretKey) -> Result<Option<Secret>, StoreError> {
        Ok(self.secret(key))
    }

    async fn create(&self, key: &SecretKey, desired: &DesiredSecret) -> Result<Secret, StoreError> {
        self.take_injected_conflict(key)?;
        let mut secrets = self.lock();
        if secrets.contains_key(key) {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                message: format!("secrets \"{}\" already exists", key.name),
            });
        }
        let mut secret = new_secret(key, desired);
        fold_string_data(&mut secret, None);
        secret.metadata.resource_version = Some(self.bump_version());
        secrets.insert(key.clone(), secret.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(secret)
    }

    async fn patch(
        &self,
        key: &SecretKey,
        desired: &DesiredSecret,
        resource_version: Option<&str>,
    ) -> Result<Secret, StoreError> {
        self.take_injected_conflict(key)?;
        let mut secrets = self.lock();
        let secret = secrets.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if let Some(rv) = resource_version
            && secret.metadata.resource_version.as_deref() != Some(rv)
        {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                message: "the object has been modified".into(),
            });
        }

        if !desired.labels.is_empty() {
            secret
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(desired.labels.clone());
        }
        fold_string_data(secret, Some(&desired.string_data));
        secret.metadata.resource_version = Some(self.bump_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(secret.clone())
    }
}

fn fold_string_data(secret: &mut Secret, extra: Option<&BTreeMap<String, String>>) {
    let mut string_data = secret.string_data.take().unwrap_or_default();
    if let Some(extra) = extra {
        string_data.extend(extra.clone());
    }
    if string_data.is_empty() {
        return;
    }
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    for (k, v) in string_data {
        data.insert(k, ByteString(v.into_bytes()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(pairs: &[(&str, &str)]) -> DesiredSecret {
        DesiredSecret {
            labels: BTreeMap::new(),
            string_data: pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    #[test]
    fn secret_key_display_is_namespace_slash_name() {
        assert_eq!(SecretKey::new("ns", "creds").to_string(), "ns/creds");
    }

    #[test]
    fn merge_patch_omits_metadata_without_labels_or_version() {
        let patch = merge_patch(&desired(&[("token", "t")]), None);
        assert_eq!(patch, json!({"stringData": {"token": "t"}}));
    }

    #[test]
    fn merge_patch_carries_labels_and_resource_version() {
        let mut d = desired(&[("password", "p")]);
        d.labels.insert("a".into(), "b".into());
        let patch = merge_patch(&d, Some("42"));
        assert_eq!(
            patch,
            json!({
                "metadata": {"resourceVersion": "42", "labels": {"a": "b"}},
                "stringData": {"password": "p"}
            })
        );
    }

    #[test]
    fn new_secret_is_opaque_without_empty_labels() {
        let secret = new_secret(&SecretKey::new("ns", "n"), &desired(&[("token", "t")]));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.metadata.labels, None);
        assert_eq!(secret.metadata.namespace.as_deref(), Some("ns"));
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_create() {
        let store = MemorySecretStore::new();
        let key = SecretKey::new("ns", "n");
        store.create(&key, &desired(&[("token", "a")])).await.unwrap();
        let err = store.create(&key, &desired(&[("token", "b")])).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "got: {err}");
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_resource_version() {
        let store = MemorySecretStore::new();
        let key = SecretKey::new("ns", "n");
        let created = store.create(&key, &desired(&[("token", "a")])).await.unwrap();
        let rv = created.metadata.resource_version.unwrap();
        store
            .patch(&key, &desired(&[("token", "b")]), Some(&rv))
            .await
            .unwrap();
        let err = store
            .patch(&key, &desired(&[("token", "c")]), Some(&rv))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn memory_store_patch_of_missing_secret_is_not_found() {
        let store = MemorySecretStore::new();
        let err = store
            .patch(&SecretKey::new("ns", "gone"), &desired(&[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn error_display_kube_variant() {
        let utf8_err = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        let err = StoreError::Kube(kube::Error::FromUtf8(utf8_err));
        assert!(err.to_string().contains("Kubernetes API error"));
        assert!(!err.is_retryable());
    }
}
