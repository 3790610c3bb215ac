//! In-memory `ResourceStore` for tests and dry runs.
//!
//! Mimics the API server behaviours the reconciler depends on: optimistic
//! concurrency on resourceVersion, a separate status write path, deletion
//! blocked by finalizers and completed once the last finalizer is removed.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use acm_core::{CanonicalResource, ReconcileRequest};

use crate::store::{ResourceStore, StoreError};

#[derive(Default)]
struct MemState {
    objects: BTreeMap<ReconcileRequest, CanonicalResource>,
    next_rv: u64,
    fail_get: Option<StoreError>,
    fail_list: Option<StoreError>,
    fail_update: Option<StoreError>,
    fail_status: Option<StoreError>,
    status_writes: usize,
    updates: usize,
}

impl MemState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn check_rv(&self, key: &ReconcileRequest, obj: &CanonicalResource) -> Result<(), StoreError> {
        let cur = self.objects.get(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != cur.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "{}: resourceVersion {:?} is stale (current {:?})",
                key, obj.metadata.resource_version, cur.metadata.resource_version
            )));
        }
        Ok(())
    }
}

/// Canonical resources kept in key order, so `list` returns a stable order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemState>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an object as an administrator would: fresh uid, generation 1.
    pub fn insert(&self, mut obj: CanonicalResource) -> CanonicalResource {
        let mut st = self.lock();
        let rv = st.bump();
        obj.metadata.resource_version = Some(rv.clone());
        obj.metadata.uid.get_or_insert_with(|| format!("uid-{}", rv));
        obj.metadata.generation.get_or_insert(1);
        obj.metadata.creation_timestamp.get_or_insert_with(acm_core::now);
        st.objects.insert(obj.key(), obj.clone());
        obj
    }

    pub fn snapshot(&self, key: &ReconcileRequest) -> Option<CanonicalResource> { self.lock().objects.get(key).cloned() }
    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn status_writes(&self) -> usize { self.lock().status_writes }
    pub fn updates(&self) -> usize { self.lock().updates }

    pub fn fail_get(&self, err: Option<StoreError>) { self.lock().fail_get = err; }
    pub fn fail_list(&self, err: Option<StoreError>) { self.lock().fail_list = err; }
    pub fn fail_update(&self, err: Option<StoreError>) { self.lock().fail_update = err; }
    pub fn fail_status(&self, err: Option<StoreError>) { self.lock().fail_status = err; }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ReconcileRequest) -> Result<CanonicalResource, StoreError> {
        let st = self.lock();
        if let Some(e) = st.fail_get.clone() {
            return Err(e);
        }
        st.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<CanonicalResource>, StoreError> {
        let st = self.lock();
        if let Some(e) = st.fail_list.clone() {
            return Err(e);
        }
        Ok(st.objects.values().cloned().collect())
    }

    async fn update(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError> {
        let mut st = self.lock();
        if let Some(e) = st.fail_update.clone() {
            return Err(e);
        }
        let key = obj.key();
        st.check_rv(&key, obj)?;
        let rv = st.bump();
        st.updates += 1;
        let Some(cur) = st.objects.get_mut(&key) else { return Err(StoreError::NotFound(key.to_string())) };
        if cur.spec != obj.spec {
            cur.metadata.generation = Some(cur.metadata.generation.unwrap_or(0) + 1);
            cur.spec = obj.spec.clone();
        }
        cur.metadata.finalizers = obj.metadata.finalizers.clone();
        cur.metadata.labels = obj.metadata.labels.clone();
        cur.metadata.annotations = obj.metadata.annotations.clone();
        cur.metadata.resource_version = Some(rv);
        let out = cur.clone();
        let released = out.is_deleting() && out.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if released {
            st.objects.remove(&key);
        }
        Ok(out)
    }

    async fn update_status(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError> {
        let mut st = self.lock();
        if let Some(e) = st.fail_status.clone() {
            return Err(e);
        }
        let key = obj.key();
        st.check_rv(&key, obj)?;
        let rv = st.bump();
        st.status_writes += 1;
        let Some(cur) = st.objects.get_mut(&key) else { return Err(StoreError::NotFound(key.to_string())) };
        cur.status = obj.status.clone();
        cur.metadata.resource_version = Some(rv);
        Ok(cur.clone())
    }

    async fn delete(&self, key: &ReconcileRequest) -> Result<(), StoreError> {
        let mut st = self.lock();
        let blocked = {
            let cur = st.objects.get(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            cur.metadata.finalizers.as_ref().map_or(false, |f| !f.is_empty())
        };
        if !blocked {
            st.objects.remove(key);
            return Ok(());
        }
        let rv = st.bump();
        if let Some(cur) = st.objects.get_mut(key) {
            cur.metadata.deletion_timestamp.get_or_insert_with(acm_core::now);
            cur.metadata.resource_version = Some(rv);
        }
        Ok(())
    }
}
