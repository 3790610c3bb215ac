//! ACM predicate engine: a closed set of event filters plus AND/OR composition,
//! resolved at registration time and evaluated against typed event pairs.

#![forbid(unsafe_code)]

use acm_core::event::{annotations_of, labels_of};
use acm_core::{ObjectEvent, PART_OF_LABEL};
use kube::core::DynamicObject;

pub mod autoscaler;
pub mod selector;

pub use autoscaler::AUTOSCALER_GVK_KEY;
pub use selector::SelectorMatcher;

/// Event filter. Change predicates compare old and new on updates and pass
/// creates and deletes through; the selector checks the event's current object.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    LabelChanged,
    AnnotationChanged,
    GenerationChanged,
    ResourceVersionChanged,
    LabelSelector(SelectorMatcher),
    AutoscalerStatusChanged,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn and(preds: impl IntoIterator<Item = Predicate>) -> Self { Predicate::All(preds.into_iter().collect()) }
    pub fn or(preds: impl IntoIterator<Item = Predicate>) -> Self { Predicate::Any(preds.into_iter().collect()) }

    /// Filter for the canonical kind itself. Resource-version changes are left
    /// out so status writes do not re-trigger their own reconcile.
    pub fn omit_status_changes() -> Self {
        Predicate::or([Predicate::LabelChanged, Predicate::AnnotationChanged, Predicate::GenerationChanged])
    }

    /// Ownership filter: objects labelled `app.kubernetes.io/part-of=<part_of>`.
    pub fn owned_by(part_of: &str) -> Self {
        Predicate::LabelSelector(SelectorMatcher::match_labels([(PART_OF_LABEL, part_of)]))
    }

    /// Default filter for a managed kind.
    pub fn for_kind(gvk_key: &str) -> Self {
        if gvk_key == AUTOSCALER_GVK_KEY {
            Predicate::AutoscalerStatusChanged
        } else {
            Predicate::ResourceVersionChanged
        }
    }

    pub fn evaluate(&self, ev: &ObjectEvent) -> bool {
        match self {
            Predicate::LabelSelector(m) => m.matches(ev.labels()),
            Predicate::All(ps) => ps.iter().all(|p| p.evaluate(ev)),
            Predicate::Any(ps) => ps.iter().any(|p| p.evaluate(ev)),
            change => match ev {
                ObjectEvent::Create(_) | ObjectEvent::Delete(_) => true,
                ObjectEvent::Update { old, new } => change.update_changed(old, new),
            },
        }
    }

    fn update_changed(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        match self {
            Predicate::LabelChanged => labels_of(old) != labels_of(new),
            Predicate::AnnotationChanged => annotations_of(old) != annotations_of(new),
            Predicate::GenerationChanged => old.metadata.generation != new.metadata.generation,
            Predicate::ResourceVersionChanged => resource_version_changed(old, new),
            Predicate::AutoscalerStatusChanged => autoscaler::status_changed(old, new),
            _ => true,
        }
    }
}

pub(crate) fn resource_version_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    old.metadata.resource_version != new.metadata.resource_version
}
