//! ACM core types: the canonical resource, its status vocabulary, reconcile
//! requests and the typed watch event model shared by every other crate.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::{GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod event;

pub use conditions::{Condition, ConditionStatus};
pub use event::{KindEvent, ObjectEvent};

/// Label every managed object carries; its value names the owning controller.
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Default ownership label value and SSA field manager.
pub const DEFAULT_PART_OF: &str = "application-connector-manager";

/// Default finalizer token placed on the canonical resource.
pub const DEFAULT_FINALIZER: &str = "application-connector-manager.kyma-project.io/deletion-hook";

/// Condition types recorded on the canonical resource.
pub mod condition_type {
    pub const INSTALLED: &str = "Installed";
    pub const DELETED: &str = "Deleted";
}

/// Machine-stable condition reasons.
pub mod reason {
    pub const VERIFICATION: &str = "Verification";
    pub const VERIFIED: &str = "Verified";
    pub const VERIFICATION_ERR: &str = "VerificationErr";
    pub const APPLY_OBJ_ERROR: &str = "ApplyObjError";
    pub const INITIALIZED: &str = "Initialized";
    pub const DELETION: &str = "Deletion";
    pub const DELETION_ERR: &str = "DeletionErr";
    pub const DELETED: &str = "Deleted";
    pub const TIMEOUT: &str = "Timeout";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
}

/// Coarse lifecycle summary persisted as `status.state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum State {
    Ready,
    Processing,
    Error,
    Deleting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Ready => "Ready",
            State::Processing => "Processing",
            State::Error => "Error",
            State::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// The single managed custom resource instance. The spec is opaque here and
/// handed verbatim to the install/cleanup steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CanonicalResource {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl CanonicalResource {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: namespace.map(|s| s.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }

    pub fn key(&self) -> ReconcileRequest {
        ReconcileRequest { namespace: self.metadata.namespace.clone(), name: self.name().to_string() }
    }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
    }

    /// Returns true when the finalizer was not present before.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|x| x != finalizer);
        before != list.len()
    }

    pub fn state(&self) -> Option<State> { self.status.as_ref().and_then(|s| s.state) }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        conditions::find(self.conditions(), type_)
    }

    pub fn set_state(&mut self, state: State) {
        self.status.get_or_insert_with(Status::default).state = Some(state);
    }

    /// Upsert a condition through the ledger, stamping the current generation.
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) -> bool {
        self.set_condition_at(type_, status, reason, message, now())
    }

    pub fn set_condition_at(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        at: Time,
    ) -> bool {
        let generation = self.metadata.generation;
        let st = self.status.get_or_insert_with(Status::default);
        conditions::upsert(
            &mut st.conditions,
            conditions::NewCondition { type_, status, reason, message, observed_generation: generation },
            at,
        )
    }

    pub fn mark_processing(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_state(State::Processing);
        self.set_condition(type_, ConditionStatus::Unknown, reason, message);
    }

    pub fn mark_ready(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_state(State::Ready);
        self.set_condition(type_, ConditionStatus::True, reason, message);
    }

    pub fn mark_error(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_state(State::Error);
        self.set_condition(type_, ConditionStatus::False, reason, message);
    }

    pub fn mark_deleting(&mut self, type_: &str, reason: &str, message: &str) {
        self.set_state(State::Deleting);
        self.set_condition(type_, ConditionStatus::Unknown, reason, message);
    }
}

/// The only unit ever enqueued: the identity of the canonical resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub namespace: Option<String>,
    pub name: String,
}

impl ReconcileRequest {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

pub fn now() -> Time { Time(chrono::Utc::now()) }

/// Render a GVK as `v1/Kind` (core group) or `group/v1/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, CoreError> {
    let parts: Vec<_> = key.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(CoreError::InvalidGvkKey(key.to_string()));
    }
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(CoreError::InvalidGvkKey(key.to_string())),
    }
}

pub mod prelude {
    pub use super::{
        condition_type, reason, CanonicalResource, Condition, ConditionStatus, KindEvent, ObjectEvent,
        ReconcileRequest, State, Status,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_parse_both_forms() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(gvk_key(&core), "v1/ConfigMap");
        let hpa = parse_gvk_key("autoscaling/v2/HorizontalPodAutoscaler").unwrap();
        assert_eq!(hpa.group, "autoscaling");
        assert_eq!(hpa.kind, "HorizontalPodAutoscaler");
        assert!(parse_gvk_key("ConfigMap").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("/v1/Kind").is_err());
    }

    #[test]
    fn finalizer_add_remove() {
        let mut cr = CanonicalResource::new(Some("kyma-system"), "default");
        assert!(cr.add_finalizer(DEFAULT_FINALIZER));
        assert!(!cr.add_finalizer(DEFAULT_FINALIZER));
        assert_eq!(cr.metadata.finalizers.as_ref().unwrap().len(), 1);
        assert!(cr.remove_finalizer(DEFAULT_FINALIZER));
        assert!(!cr.remove_finalizer(DEFAULT_FINALIZER));
        assert!(!cr.has_finalizer(DEFAULT_FINALIZER));
    }

    #[test]
    fn mark_helpers_set_state_and_condition() {
        let mut cr = CanonicalResource::new(Some("kyma-system"), "default");
        cr.metadata.generation = Some(3);
        cr.mark_processing(condition_type::INSTALLED, reason::INITIALIZED, "initializing");
        assert_eq!(cr.state(), Some(State::Processing));
        let c = cr.condition(condition_type::INSTALLED).unwrap();
        assert_eq!(c.status, ConditionStatus::Unknown);
        assert_eq!(c.observed_generation, Some(3));

        cr.mark_error(condition_type::INSTALLED, reason::APPLY_OBJ_ERROR, "boom");
        assert_eq!(cr.state(), Some(State::Error));
        assert_eq!(cr.conditions().len(), 1);
        assert_eq!(cr.condition(condition_type::INSTALLED).unwrap().message, "boom");
    }

    #[test]
    fn status_serializes_to_persisted_shape() {
        let mut cr = CanonicalResource::new(Some("kyma-system"), "default");
        cr.mark_ready(condition_type::INSTALLED, reason::VERIFIED, "installed");
        let v = serde_json::to_value(&cr).unwrap();
        assert_eq!(v["status"]["state"], "Ready");
        let c = &v["status"]["conditions"][0];
        assert_eq!(c["type"], "Installed");
        assert_eq!(c["status"], "True");
        assert_eq!(c["reason"], "Verified");
        assert!(c["lastTransitionTime"].is_string());

        let back: CanonicalResource = serde_json::from_value(v).unwrap();
        assert_eq!(back.state(), Some(State::Ready));
        assert_eq!(back.conditions().len(), 1);
    }

    #[test]
    fn request_display() {
        assert_eq!(ReconcileRequest::new(Some("ns"), "a").to_string(), "ns/a");
        assert_eq!(ReconcileRequest::new(None, "a").to_string(), "a");
    }
}
