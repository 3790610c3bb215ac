#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use acm_core::{condition_type, CanonicalResource, ConditionStatus, ReconcileRequest, State, DEFAULT_FINALIZER};
use acm_kubehub::{MemoryStore, ResourceStore, StoreError};
use acm_kubehub::MemoryEvents;
use acm_reconcile::{InstallStep, ReconcileError, Reconciler, ReconcilerConfig, StepError};
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;

/// Install/cleanup double replaying scripted results; succeeds once the script runs out.
#[derive(Default)]
struct ScriptedSteps {
    apply: Mutex<VecDeque<Result<(), StepError>>>,
    cleanup: Mutex<VecDeque<Result<(), StepError>>>,
    apply_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    stall: Option<Duration>,
}

impl ScriptedSteps {
    fn applying(results: Vec<Result<(), StepError>>) -> Self {
        Self { apply: Mutex::new(results.into()), ..Default::default() }
    }

    fn cleaning(results: Vec<Result<(), StepError>>) -> Self {
        Self { cleanup: Mutex::new(results.into()), ..Default::default() }
    }
}

#[async_trait::async_trait]
impl InstallStep for ScriptedSteps {
    async fn apply(&self, _spec: &serde_json::Value) -> Result<(), StepError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.stall {
            tokio::time::sleep(d).await;
        }
        self.apply.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn cleanup(&self, _spec: &serde_json::Value) -> Result<(), StepError> {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.stall {
            tokio::time::sleep(d).await;
        }
        self.cleanup.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

fn setup(steps: ScriptedSteps) -> (Arc<MemoryStore>, Arc<ScriptedSteps>, Reconciler<MemoryStore, ScriptedSteps>) {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(steps);
    let r = Reconciler::new(store.clone(), steps.clone(), ReconcilerConfig::default());
    (store, steps, r)
}

/// A token nobody cancels.
fn never() -> CancellationToken {
    CancellationToken::new()
}

fn fresh(store: &MemoryStore) -> ReconcileRequest {
    let mut cr = CanonicalResource::new(Some("kyma-system"), "default");
    cr.spec = serde_json::json!({ "domainName": "example.com" });
    store.insert(cr).key()
}

#[tokio::test]
async fn fresh_resource_becomes_ready() {
    let (store, steps, r) = setup(ScriptedSteps::default());
    let key = fresh(&store);

    let out = r.reconcile(&key, &never()).await;
    assert!(!out.requeue);
    assert!(out.error.is_none());

    let live = store.snapshot(&key).unwrap();
    assert_eq!(live.state(), Some(State::Ready));
    assert!(live.has_finalizer(DEFAULT_FINALIZER));
    assert_eq!(live.conditions().len(), 1);
    let c = live.condition(condition_type::INSTALLED).unwrap();
    assert_eq!(c.status, ConditionStatus::True);
    assert_eq!(c.reason, "Verified");
    assert_eq!(c.observed_generation, Some(1));
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 1);
    // Processing then Ready, each written with its condition
    assert_eq!(store.status_writes(), 2);
}

#[tokio::test]
async fn install_failure_records_error() {
    let (store, _steps, r) = setup(ScriptedSteps::applying(vec![Err(StepError::new("ApplyObjError", "boom"))]));
    let key = fresh(&store);

    let out = r.reconcile(&key, &never()).await;
    assert!(out.requeue);
    assert!(matches!(out.error, Some(ReconcileError::Step(ref e)) if e.reason == "ApplyObjError"));

    let live = store.snapshot(&key).unwrap();
    assert_eq!(live.state(), Some(State::Error));
    assert_eq!(live.conditions().len(), 1);
    let c = live.condition(condition_type::INSTALLED).unwrap();
    assert_eq!(c.status, ConditionStatus::False);
    assert_eq!(c.reason, "ApplyObjError");
    assert_eq!(c.message, "boom");
}

#[tokio::test]
async fn retry_after_failure_recovers() {
    let (store, steps, r) = setup(ScriptedSteps::applying(vec![Err(StepError::new("ApplyObjError", "boom"))]));
    let key = fresh(&store);
    assert!(r.reconcile(&key, &never()).await.requeue);
    let out = r.reconcile(&key, &never()).await;
    assert!(!out.requeue);

    let live = store.snapshot(&key).unwrap();
    assert_eq!(live.state(), Some(State::Ready));
    assert_eq!(live.conditions().len(), 1);
    assert_eq!(live.condition(condition_type::INSTALLED).unwrap().status, ConditionStatus::True);
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 2);
    // finalizer added once only
    assert_eq!(store.updates(), 1);
}

#[tokio::test]
async fn deletion_removes_finalizer_and_object() {
    let (store, steps, r) = setup(ScriptedSteps::default());
    let key = fresh(&store);
    r.reconcile(&key, &never()).await;

    store.delete(&key).await.unwrap();
    assert!(store.snapshot(&key).unwrap().is_deleting());

    let out = r.reconcile(&key, &never()).await;
    assert!(!out.requeue);
    assert!(out.error.is_none());
    assert_eq!(steps.cleanup_calls.load(Ordering::SeqCst), 1);
    assert!(store.snapshot(&key).is_none(), "object released once the finalizer is gone");

    let again = r.reconcile(&key, &never()).await;
    assert!(!again.requeue);
    assert!(again.error.is_none());
    assert_eq!(steps.cleanup_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_failure_keeps_finalizer() {
    let (store, _steps, r) = setup(ScriptedSteps::cleaning(vec![Err(StepError::new("DeletionErr", "webhook still present"))]));
    let key = fresh(&store);
    r.reconcile(&key, &never()).await;
    store.delete(&key).await.unwrap();

    let out = r.reconcile(&key, &never()).await;
    assert!(out.requeue);
    let live = store.snapshot(&key).unwrap();
    assert!(live.has_finalizer(DEFAULT_FINALIZER));
    assert_eq!(live.state(), Some(State::Error));
    let c = live.condition(condition_type::DELETED).unwrap();
    assert_eq!(c.status, ConditionStatus::False);
    assert_eq!(c.reason, "DeletionErr");
    assert_eq!(c.message, "webhook still present");

    // the next attempt succeeds and releases the object
    assert!(!r.reconcile(&key, &never()).await.requeue);
    assert!(store.snapshot(&key).is_none());
}

#[tokio::test]
async fn deleting_without_finalizer_is_left_alone() {
    let (store, steps, r) = setup(ScriptedSteps::default());
    let mut cr = CanonicalResource::new(Some("kyma-system"), "default");
    cr.add_finalizer("someone.else/hook");
    let key = store.insert(cr).key();
    store.delete(&key).await.unwrap();

    let out = r.reconcile(&key, &never()).await;
    assert!(!out.requeue);
    assert_eq!(steps.cleanup_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.status_writes(), 0);
}

#[tokio::test]
async fn missing_resource_is_not_an_error() {
    let (_store, steps, r) = setup(ScriptedSteps::default());
    let out = r.reconcile(&ReconcileRequest::new(Some("kyma-system"), "gone"), &never()).await;
    assert!(!out.requeue);
    assert!(out.error.is_none());
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fetch_failure_requeues() {
    let (store, _steps, r) = setup(ScriptedSteps::default());
    let key = fresh(&store);
    store.fail_get(Some(StoreError::Api("context canceled".into())));
    let out = r.reconcile(&key, &never()).await;
    assert!(out.requeue);
    assert!(matches!(out.error, Some(ReconcileError::Store(StoreError::Api(_)))));
}

#[tokio::test]
async fn status_conflict_requeues_without_partial_write() {
    let (store, steps, r) = setup(ScriptedSteps::default());
    let key = fresh(&store);
    store.fail_status(Some(StoreError::Conflict("object has been modified".into())));

    let out = r.reconcile(&key, &never()).await;
    assert!(out.requeue);
    assert!(matches!(out.error, Some(ReconcileError::Store(StoreError::Conflict(_)))));
    let live = store.snapshot(&key).unwrap();
    assert!(live.status.is_none());
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_install_times_out() {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(ScriptedSteps { stall: Some(Duration::from_secs(60)), ..Default::default() });
    let cfg = ReconcilerConfig { step_timeout: Duration::from_secs(5), ..Default::default() };
    let r = Reconciler::new(store.clone(), steps, cfg);
    let key = fresh(&store);

    let out = r.reconcile(&key, &never()).await;
    assert!(out.requeue);
    let c = store.snapshot(&key).unwrap().condition(condition_type::INSTALLED).cloned().unwrap();
    assert_eq!(c.status, ConditionStatus::False);
    assert_eq!(c.reason, "Timeout");
}

#[tokio::test]
async fn shutdown_abandons_a_running_step_without_status() {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(ScriptedSteps { stall: Some(Duration::from_secs(3)), ..Default::default() });
    let r = Reconciler::new(store.clone(), steps.clone(), ReconcilerConfig::default());
    let key = fresh(&store);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let out = r.reconcile(&key, &cancel).await;
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert!(out.requeue);
    assert!(matches!(out.error, Some(ReconcileError::Cancelled)));
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 1);
    // only the Processing write from before the step
    assert_eq!(store.status_writes(), 1);
    assert_eq!(store.snapshot(&key).unwrap().state(), Some(State::Processing));
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let (store, steps, r) = setup(ScriptedSteps::default());
    let key = fresh(&store);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let out = r.reconcile(&key, &cancel).await;
    assert!(out.requeue);
    assert!(matches!(out.error, Some(ReconcileError::Cancelled)));
    assert_eq!(steps.apply_calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.updates(), 0);
    assert_eq!(store.status_writes(), 0);
}

#[tokio::test]
async fn transitions_are_published_as_events() {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(ScriptedSteps::applying(vec![Err(StepError::new("ApplyObjError", "boom"))]));
    let events = Arc::new(MemoryEvents::new());
    let r = Reconciler::new(store.clone(), steps, ReconcilerConfig::default()).with_events(events.clone());
    let key = fresh(&store);

    r.reconcile(&key, &never()).await;
    r.reconcile(&key, &never()).await;
    store.delete(&key).await.unwrap();
    r.reconcile(&key, &never()).await;

    assert_eq!(events.reasons(), vec!["Initialized", "ApplyObjError", "Initialized", "Verified", "Deletion"]);
    let all = events.events();
    assert_eq!(all[1].type_, EventType::Warning);
    assert_eq!(all[1].note, "boom");
    assert_eq!(all[1].action, "Install");
    assert_eq!(all[3].type_, EventType::Normal);
    assert_eq!(all[4].action, "Delete");
    assert!(all.iter().all(|e| e.object == "kyma-system/default"));
}

#[tokio::test]
async fn unchanged_status_publishes_no_event() {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(ScriptedSteps { stall: Some(Duration::from_millis(200)), ..Default::default() });
    let events = Arc::new(MemoryEvents::new());
    let r = Reconciler::new(store.clone(), steps, ReconcilerConfig::default()).with_events(events.clone());
    let key = fresh(&store);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    r.reconcile(&key, &cancel).await;
    assert_eq!(events.reasons(), vec!["Initialized"]);

    // still Processing from the abandoned pass, so only Ready is announced
    r.reconcile(&key, &never()).await;
    assert_eq!(events.reasons(), vec!["Initialized", "Verified"]);
}

/// Step that only looks at the spec it is handed.
#[derive(Default)]
struct SpecRecorder {
    seen: Mutex<Vec<serde_json::Value>>,
}

#[async_trait::async_trait]
impl InstallStep for SpecRecorder {
    async fn apply(&self, spec: &serde_json::Value) -> Result<(), StepError> {
        self.seen.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn cleanup(&self, _spec: &serde_json::Value) -> Result<(), StepError> {
        Ok(())
    }
}

#[tokio::test]
async fn install_step_receives_current_spec() {
    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(SpecRecorder::default());
    let r = Reconciler::new(store.clone(), steps.clone(), ReconcilerConfig::default());
    let key = fresh(&store);

    r.reconcile(&key, &never()).await;
    assert_eq!(*steps.seen.lock().unwrap(), vec![serde_json::json!({ "domainName": "example.com" })]);
}
