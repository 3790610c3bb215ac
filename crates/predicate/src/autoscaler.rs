//! Semantic diff for HorizontalPodAutoscaler status.
//!
//! Autoscalers bump their resourceVersion on nearly every metrics sync. Only a
//! change in the ordered condition list or the current replica count is worth
//! a reconcile of the canonical resource.

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerStatus;
use kube::core::DynamicObject;
use tracing::{debug, warn};

use crate::resource_version_changed;

pub const AUTOSCALER_GVK_KEY: &str = "autoscaling/v2/HorizontalPodAutoscaler";

fn decode_status(obj: &DynamicObject) -> Result<Option<HorizontalPodAutoscalerStatus>, serde_json::Error> {
    match obj.data.get("status") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone()).map(Some),
    }
}

/// Decide whether an autoscaler update is significant. Decode failures on either
/// side fail open.
pub fn status_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    if !resource_version_changed(old, new) {
        return false;
    }
    let (old_status, new_status) = match (decode_status(old), decode_status(new)) {
        (Ok(o), Ok(n)) => (o, n),
        (Err(e), _) | (_, Err(e)) => {
            metrics::counter!("predicate_decode_failures_total", 1u64);
            warn!(
                name = ?new.metadata.name,
                ns = ?new.metadata.namespace,
                error = %e,
                "autoscaler status decode failed; treating as changed"
            );
            return true;
        }
    };
    let conditions_equal = old_status.as_ref().and_then(|s| s.conditions.as_ref())
        == new_status.as_ref().and_then(|s| s.conditions.as_ref());
    let replicas_equal = old_status.as_ref().and_then(|s| s.current_replicas)
        == new_status.as_ref().and_then(|s| s.current_replicas);
    let changed = !conditions_equal || !replicas_equal;
    if changed {
        debug!(
            name = ?new.metadata.name,
            ns = ?new.metadata.namespace,
            conditions_equal,
            replicas_equal,
            "reconciliation triggered by autoscaler"
        );
    }
    changed
}
