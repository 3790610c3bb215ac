//! Typed watch events over dynamic objects.

use std::collections::BTreeMap;

use kube::core::DynamicObject;

/// A change observed on a watched object. `Update` carries the previously seen
/// version so predicates can compare old against new.
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    Create(DynamicObject),
    Update { old: DynamicObject, new: DynamicObject },
    Delete(DynamicObject),
}

impl ObjectEvent {
    /// The object the event is about (the new version for updates).
    pub fn object(&self) -> &DynamicObject {
        match self {
            ObjectEvent::Create(o) | ObjectEvent::Delete(o) => o,
            ObjectEvent::Update { new, .. } => new,
        }
    }

    pub fn old(&self) -> Option<&DynamicObject> {
        match self {
            ObjectEvent::Update { old, .. } => Some(old),
            _ => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ObjectEvent::Create(_) => "create",
            ObjectEvent::Update { .. } => "update",
            ObjectEvent::Delete(_) => "delete",
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> { labels_of(self.object()) }
}

/// An event tagged with the GVK key of the watch that produced it.
#[derive(Debug, Clone)]
pub struct KindEvent {
    pub gvk: String,
    pub event: ObjectEvent,
}

pub fn labels_of(obj: &DynamicObject) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    obj.metadata.labels.as_ref().unwrap_or(&EMPTY)
}

pub fn annotations_of(obj: &DynamicObject) -> &BTreeMap<String, String> {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    obj.metadata.annotations.as_ref().unwrap_or(&EMPTY)
}
