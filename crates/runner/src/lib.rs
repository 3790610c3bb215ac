//! Controller wiring for the canonical resource.
//!
//! Scheduling belongs to `kube::runtime::Controller`, which keeps at most one
//! reconcile in flight per object and drains on shutdown. Canonical-kind watch
//! events drive it directly; redirected managed-object events arrive through
//! `reconcile_on`.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use acm_core::{KindEvent, ObjectEvent, ReconcileRequest};
use acm_dispatch::WatchDispatcher;
use acm_kubehub::{object_events, ResourceStore};
use acm_reconcile::{InstallStep, ReconcileError, Reconciler};
use futures::{future, Stream, StreamExt};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared state handed to every reconcile.
pub struct Context<S: ResourceStore + ?Sized, I: InstallStep + ?Sized> {
    pub reconciler: Reconciler<S, I>,
    /// Cancelled on SIGTERM/Ctrl-C. Each reconcile runs under a child token.
    pub shutdown: CancellationToken,
    /// Delay before a retryable failure is reconciled again.
    pub retry_after: Duration,
}

impl<S: ResourceStore + ?Sized, I: InstallStep + ?Sized> Context<S, I> {
    pub fn new(reconciler: Reconciler<S, I>, shutdown: CancellationToken, retry_after: Duration) -> Self {
        Self { reconciler, shutdown, retry_after }
    }
}

pub async fn reconcile<S, I>(obj: Arc<DynamicObject>, ctx: Arc<Context<S, I>>) -> Result<Action, ReconcileError>
where
    S: ResourceStore + ?Sized + 'static,
    I: InstallStep + ?Sized + 'static,
{
    let req = ReconcileRequest::new(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or_default());
    let cancel = ctx.shutdown.child_token();
    let outcome = ctx.reconciler.reconcile(&req, &cancel).await;
    match outcome.error {
        Some(e) => Err(e),
        None => Ok(Action::await_change()),
    }
}

pub fn error_policy<S, I>(obj: Arc<DynamicObject>, error: &ReconcileError, ctx: Arc<Context<S, I>>) -> Action
where
    S: ResourceStore + ?Sized,
    I: InstallStep + ?Sized,
{
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    if matches!(error, ReconcileError::Cancelled) {
        info!(name, "reconcile cancelled by shutdown");
    } else {
        error!(?error, name, retryable = error.is_retryable(), "reconciliation failed");
    }
    if error.is_retryable() {
        Action::requeue(ctx.retry_after)
    } else {
        Action::await_change()
    }
}

pub fn object_ref(req: &ReconcileRequest, ar: &ApiResource) -> ObjectRef<DynamicObject> {
    let obj_ref = ObjectRef::new_with(&req.name, ar.clone());
    match &req.namespace {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    }
}

/// Canonical-kind watch output filtered through the dispatcher's own-kind
/// predicate, so status writes do not trigger another reconcile. Deletions are
/// dropped; the reflector forgets the object and nothing is left to reconcile.
pub fn canonical_triggers<S, W>(
    dispatcher: Arc<WatchDispatcher<S>>,
    raw: W,
) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static
where
    S: ResourceStore + ?Sized + 'static,
    W: Stream<Item = Result<Event<DynamicObject>, watcher::Error>> + Send + 'static,
{
    let gvk = dispatcher.canonical().to_string();
    object_events(raw).filter_map(move |item| {
        let out = match item {
            Ok(ObjectEvent::Delete(_)) => None,
            Ok(event) => {
                let ev = KindEvent { gvk: gvk.clone(), event };
                if dispatcher.admits(&ev) {
                    Some(Ok(ev.event.object().clone()))
                } else {
                    metrics::counter!("dispatch_filtered_total", 1u64, "gvk" => gvk.clone());
                    None
                }
            }
            Err(e) => Some(Err(e)),
        };
        future::ready(out)
    })
}

fn log_reconcile_result<T: std::fmt::Debug>(
    result: Result<T, controller::Error<ReconcileError, watcher::Error>>,
) -> future::Ready<()> {
    match result {
        Ok(action) => debug!(?action, "reconciliation completed"),
        Err(controller::Error::ObjectNotFound(obj_ref)) => debug!(%obj_ref, "object gone before reconcile"),
        Err(controller::Error::ReconcilerFailed(..)) => {}
        Err(e) => error!(error = ?e, "controller error"),
    }
    future::ready(())
}

/// Controller future for the canonical kind. Resolves once `ctx.shutdown` is
/// cancelled and every running reconcile has returned.
pub fn controller<S, I, T, R>(
    reader: Store<DynamicObject>,
    ar: ApiResource,
    triggers: T,
    redirects: R,
    ctx: Arc<Context<S, I>>,
    concurrency: u16,
) -> impl Future<Output = ()> + Send
where
    S: ResourceStore + ?Sized + 'static,
    I: InstallStep + ?Sized + 'static,
    T: Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static,
    R: Stream<Item = ReconcileRequest> + Send + 'static,
{
    let redirect_ar = ar.clone();
    let shutdown = ctx.shutdown.clone();
    info!(kind = %ar.kind, concurrency, "controller started");
    Controller::for_stream_with(triggers, reader, ar)
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_on(redirects.map(move |req| object_ref(&req, &redirect_ar)))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile::<S, I>, error_policy::<S, I>, ctx)
        .for_each(log_reconcile_result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;

    #[test]
    fn object_ref_carries_namespace() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("operator.kyma-project.io", "v1alpha1", "ApplicationConnector"));
        let r = object_ref(&ReconcileRequest::new(Some("kyma-system"), "default"), &ar);
        assert_eq!(r.name, "default");
        assert_eq!(r.namespace.as_deref(), Some("kyma-system"));
        assert!(object_ref(&ReconcileRequest::new(None, "default"), &ar).namespace.is_none());
    }
}
