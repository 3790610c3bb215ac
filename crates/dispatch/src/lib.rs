//! ACM watch dispatcher.
//!
//! Holds one registration per watched kind, filters events through the kind's
//! predicate plus the ownership label, and redirects every surviving event to
//! the single canonical resource.

#![forbid(unsafe_code)]

use std::sync::Arc;

use acm_core::{CoreError, KindEvent, ReconcileRequest};
use acm_kubehub::ResourceStore;
use acm_predicate::Predicate;
use kube::core::DynamicObject;
use futures::{Stream, StreamExt};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("watch for {0} already registered")]
    DuplicateKind(String),
    #[error(transparent)]
    InvalidGvk(#[from] CoreError),
    #[error("object {0} has no apiVersion/kind")]
    MissingTypeMeta(String),
}

/// One watched kind and the filter gating its events.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub gvk: String,
    pub predicate: Predicate,
}

pub struct WatchDispatcher<S: ResourceStore + ?Sized> {
    store: Arc<S>,
    primary: Registration,
    ownership: Predicate,
    managed: Vec<Registration>,
}

impl<S: ResourceStore + ?Sized> WatchDispatcher<S> {
    /// `canonical_gvk` is watched for its own label/annotation/generation
    /// changes; managed kinds must carry `app.kubernetes.io/part-of=<part_of>`.
    pub fn new(store: Arc<S>, canonical_gvk: &str, part_of: &str) -> Result<Self, DispatchError> {
        acm_core::parse_gvk_key(canonical_gvk)?;
        Ok(Self {
            store,
            primary: Registration { gvk: canonical_gvk.to_string(), predicate: Predicate::omit_status_changes() },
            ownership: Predicate::owned_by(part_of),
            managed: Vec::new(),
        })
    }

    fn is_registered(&self, gvk: &str) -> bool {
        self.primary.gvk == gvk || self.managed.iter().any(|r| r.gvk == gvk)
    }

    /// Register a managed kind. A kind may be registered only once.
    pub fn register(&mut self, gvk: &str, predicate: Predicate) -> Result<(), DispatchError> {
        acm_core::parse_gvk_key(gvk)?;
        if self.is_registered(gvk) {
            return Err(DispatchError::DuplicateKind(gvk.to_string()));
        }
        info!(gvk = %gvk, "adding watcher");
        self.managed.push(Registration { gvk: gvk.to_string(), predicate });
        Ok(())
    }

    /// Register one watch per distinct kind among `objects`, with the default
    /// predicate for each kind. Kinds already registered are skipped.
    pub fn register_distinct<'a, I>(&mut self, objects: I) -> Result<usize, DispatchError>
    where
        I: IntoIterator<Item = &'a DynamicObject>,
    {
        let mut added = 0;
        for obj in objects {
            let gvk = object_gvk_key(obj)?;
            if self.is_registered(&gvk) {
                continue;
            }
            let predicate = Predicate::for_kind(&gvk);
            self.register(&gvk, predicate)?;
            added += 1;
        }
        Ok(added)
    }

    /// Every kind that needs a watch, canonical kind first.
    pub fn kinds(&self) -> Vec<&str> {
        std::iter::once(self.primary.gvk.as_str()).chain(self.managed.iter().map(|r| r.gvk.as_str())).collect()
    }

    pub fn registrations(&self) -> &[Registration] { &self.managed }

    pub fn canonical(&self) -> &str { &self.primary.gvk }

    /// Whether the event passes its kind's filter. Events from unknown kinds never do.
    pub fn admits(&self, ev: &KindEvent) -> bool {
        if ev.gvk == self.primary.gvk {
            return self.primary.predicate.evaluate(&ev.event);
        }
        match self.managed.iter().find(|r| r.gvk == ev.gvk) {
            Some(reg) => self.ownership.evaluate(&ev.event) && reg.predicate.evaluate(&ev.event),
            None => false,
        }
    }

    /// Map any watched-object event onto the canonical resource. Yields nothing
    /// when no instance exists, the first instance is being deleted, or the list fails.
    pub async fn redirect(&self, gvk: &str, trigger: &DynamicObject) -> Option<ReconcileRequest> {
        let items = match self.store.list().await {
            Ok(items) => items,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                error!(error = %e, "listing canonical resources failed");
                return None;
            }
        };
        // more than one instance: the first in list order wins
        let target = items.first()?;
        if target.is_deleting() {
            debug!(name = target.name(), "canonical resource is being deleted; not redirecting");
            return None;
        }
        debug!(
            name = ?trigger.metadata.name,
            ns = ?trigger.metadata.namespace,
            gvk = %gvk,
            rsc_ver = ?trigger.metadata.resource_version,
            canonical_rsc_ver = ?target.metadata.resource_version,
            "redirecting"
        );
        Some(target.key())
    }

    /// Filter then route one event. Canonical-kind events target the object itself.
    pub async fn dispatch(&self, ev: &KindEvent) -> Option<ReconcileRequest> {
        metrics::counter!("dispatch_events_total", 1u64, "gvk" => ev.gvk.clone());
        if !self.admits(ev) {
            metrics::counter!("dispatch_filtered_total", 1u64, "gvk" => ev.gvk.clone());
            return None;
        }
        let obj = ev.event.object();
        if ev.gvk == self.primary.gvk {
            let name = obj.metadata.name.as_deref()?;
            return Some(ReconcileRequest::new(obj.metadata.namespace.as_deref(), name));
        }
        match self.redirect(&ev.gvk, obj).await {
            Some(req) => {
                metrics::counter!("dispatch_redirects_total", 1u64);
                Some(req)
            }
            None => {
                metrics::counter!("dispatch_suppressed_total", 1u64);
                None
            }
        }
    }

    /// Turn watched-object events into reconcile requests, dropping filtered
    /// and suppressed ones. Ends when `events` ends.
    pub fn redirects<E>(self: Arc<Self>, events: E) -> impl Stream<Item = ReconcileRequest> + Send + 'static
    where
        E: Stream<Item = KindEvent> + Send + 'static,
        S: 'static,
    {
        events.filter_map(move |ev| {
            let dispatcher = self.clone();
            async move {
                let req = dispatcher.dispatch(&ev).await?;
                debug!(gvk = %ev.gvk, verb = ev.event.verb(), request = %req, "enqueue");
                Some(req)
            }
        })
    }
}

/// GVK key from an object's apiVersion/kind.
pub fn object_gvk_key(obj: &DynamicObject) -> Result<String, DispatchError> {
    let name = || obj.metadata.name.clone().unwrap_or_default();
    let types = obj.types.as_ref().ok_or_else(|| DispatchError::MissingTypeMeta(name()))?;
    if types.api_version.is_empty() || types.kind.is_empty() {
        return Err(DispatchError::MissingTypeMeta(name()));
    }
    Ok(format!("{}/{}", types.api_version, types.kind))
}
