//! Object store interface over the canonical kind.

use acm_core::{CanonicalResource, ReconcileRequest};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api: {0}")]
    Api(String),
    #[error("codec: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }

    /// Whether a requeue can plausibly succeed. Codec errors need a fixed object.
    pub fn is_retryable(&self) -> bool { !matches!(self, StoreError::Codec(_)) }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(resp.message),
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict(resp.message),
            other => StoreError::Api(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Codec(e.to_string()) }
}

/// Get/list/update/delete over canonical resources. Updates carry the
/// caller's resourceVersion; a stale version surfaces as `Conflict`.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ReconcileRequest) -> Result<CanonicalResource, StoreError>;

    /// All instances of the canonical kind across namespaces.
    async fn list(&self) -> Result<Vec<CanonicalResource>, StoreError>;

    /// Persist metadata and spec (finalizers, labels). Status is left untouched.
    async fn update(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError>;

    /// Persist `status.state` and `status.conditions` together.
    async fn update_status(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError>;

    async fn delete(&self, key: &ReconcileRequest) -> Result<(), StoreError>;
}
