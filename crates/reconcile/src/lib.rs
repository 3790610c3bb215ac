//! ACM reconciliation state machine.
//!
//! One call to [`Reconciler::reconcile`] advances the canonical resource by one
//! step: install (Processing → Ready | Error) or, once a deletion timestamp is
//! set, cleanup followed by finalizer removal. Every status change is written
//! as a single status update carrying both the state and the conditions, and
//! announced as a Kubernetes Event.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use acm_core::{condition_type, reason, CanonicalResource, ReconcileRequest, State};
use acm_kubehub::{EventPublisher, ResourceStore, StoreError};
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Event actions, shown by `kubectl get events -o wide`.
pub mod action {
    pub const INSTALL: &str = "Install";
    pub const DELETE: &str = "Delete";
}

/// Failure reported by an install or cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct StepError {
    pub reason: String,
    pub message: String,
}

impl StepError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { reason: reason.into(), message: message.into() }
    }
}

/// The opaque installation work for the canonical resource.
///
/// `spec` is the canonical resource's spec at the time of the call. It is
/// advisory: a step may derive settings from it or ignore it entirely.
#[async_trait::async_trait]
pub trait InstallStep: Send + Sync {
    /// Install and verify everything the resource stands for.
    async fn apply(&self, spec: &serde_json::Value) -> Result<(), StepError>;

    /// Remove everything `apply` created.
    async fn cleanup(&self, spec: &serde_json::Value) -> Result<(), StepError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("reconcile cancelled by shutdown")]
    Cancelled,
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Step(_) | ReconcileError::Cancelled => true,
        }
    }
}

/// Result of one reconcile. Backoff for `requeue` is the scheduler's business.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub requeue: bool,
    pub error: Option<ReconcileError>,
}

impl ReconcileOutcome {
    fn from_result(result: Result<(), ReconcileError>) -> Self {
        match result {
            Ok(()) => Self::default(),
            Err(e) => Self { requeue: e.is_retryable(), error: Some(e) },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub finalizer: String,
    pub step_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { finalizer: acm_core::DEFAULT_FINALIZER.to_string(), step_timeout: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Copy)]
enum StepKind {
    Apply,
    Cleanup,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepKind::Apply => "install",
            StepKind::Cleanup => "cleanup",
        })
    }
}

/// One lifecycle move: the state to enter plus the condition that explains it.
struct Transition<'a> {
    state: State,
    condition: &'a str,
    reason: &'a str,
    message: &'a str,
    action: &'static str,
}

impl Transition<'_> {
    fn apply_to(&self, obj: &mut CanonicalResource) {
        let Transition { state, condition, reason, message, .. } = *self;
        match state {
            State::Processing => obj.mark_processing(condition, reason, message),
            State::Ready => obj.mark_ready(condition, reason, message),
            State::Error => obj.mark_error(condition, reason, message),
            State::Deleting => obj.mark_deleting(condition, reason, message),
        }
    }

    fn event_type(&self) -> EventType {
        match self.state {
            State::Error => EventType::Warning,
            _ => EventType::Normal,
        }
    }
}

pub struct Reconciler<S: ResourceStore + ?Sized, I: InstallStep + ?Sized> {
    store: Arc<S>,
    steps: Arc<I>,
    events: Option<Arc<dyn EventPublisher>>,
    cfg: ReconcilerConfig,
}

impl<S: ResourceStore + ?Sized, I: InstallStep + ?Sized> Reconciler<S, I> {
    pub fn new(store: Arc<S>, steps: Arc<I>, cfg: ReconcilerConfig) -> Self {
        Self { store, steps, events: None, cfg }
    }

    /// Publish an Event for every recorded transition.
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Advance `req` by one step. When `cancel` fires, a running step is
    /// abandoned without recording a status and the request asks for a retry.
    #[instrument(skip_all, fields(request = %req))]
    pub async fn reconcile(&self, req: &ReconcileRequest, cancel: &CancellationToken) -> ReconcileOutcome {
        let t0 = Instant::now();
        let outcome = ReconcileOutcome::from_result(self.advance(req, cancel).await);
        let result = match (&outcome.error, outcome.requeue) {
            (None, _) => "ok",
            (Some(ReconcileError::Cancelled), _) => "cancelled",
            (Some(ReconcileError::Step(_)), _) => "step_error",
            (Some(_), true) => "retry",
            (Some(_), false) => "error",
        };
        metrics::counter!("reconcile_total", 1u64, "result" => result);
        metrics::histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &outcome.error {
            Some(ReconcileError::Cancelled) => info!("reconcile cancelled; will retry after restart"),
            Some(e) => warn!(error = %e, requeue = outcome.requeue, "reconcile failed"),
            None => {}
        }
        outcome
    }

    async fn advance(&self, req: &ReconcileRequest, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        let instance = match self.store.get(req).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!("resource not found; nothing to reconcile");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if instance.is_deleting() {
            return self.delete(instance, cancel).await;
        }
        self.install(instance, cancel).await
    }

    async fn install(&self, mut obj: CanonicalResource, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        if obj.add_finalizer(&self.cfg.finalizer) {
            obj = self.store.update(&obj).await?;
            info!(finalizer = %self.cfg.finalizer, "finalizer added");
        }

        let obj = self
            .record(
                obj,
                Transition {
                    state: State::Processing,
                    condition: condition_type::INSTALLED,
                    reason: reason::INITIALIZED,
                    message: "installation started",
                    action: action::INSTALL,
                },
            )
            .await?;

        match self.run_step(StepKind::Apply, &obj.spec, cancel).await {
            Ok(()) => {
                self.record(
                    obj,
                    Transition {
                        state: State::Ready,
                        condition: condition_type::INSTALLED,
                        reason: reason::VERIFIED,
                        message: "installed and verified",
                        action: action::INSTALL,
                    },
                )
                .await?;
                info!("ready");
                Ok(())
            }
            Err(ReconcileError::Step(e)) => {
                self.record(
                    obj,
                    Transition {
                        state: State::Error,
                        condition: condition_type::INSTALLED,
                        reason: &e.reason,
                        message: &e.message,
                        action: action::INSTALL,
                    },
                )
                .await?;
                Err(e.into())
            }
            Err(other) => Err(other),
        }
    }

    async fn delete(&self, obj: CanonicalResource, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        if !obj.has_finalizer(&self.cfg.finalizer) {
            debug!("deleting without our finalizer; nothing to clean up");
            return Ok(());
        }

        let mut obj = self
            .record(
                obj,
                Transition {
                    state: State::Deleting,
                    condition: condition_type::DELETED,
                    reason: reason::DELETION,
                    message: "deletion in progress",
                    action: action::DELETE,
                },
            )
            .await?;

        match self.run_step(StepKind::Cleanup, &obj.spec, cancel).await {
            Ok(()) => {
                obj.remove_finalizer(&self.cfg.finalizer);
                self.store.update(&obj).await?;
                info!(finalizer = %self.cfg.finalizer, "cleanup done; finalizer removed");
                Ok(())
            }
            Err(ReconcileError::Step(e)) => {
                self.record(
                    obj,
                    Transition {
                        state: State::Error,
                        condition: condition_type::DELETED,
                        reason: &e.reason,
                        message: &e.message,
                        action: action::DELETE,
                    },
                )
                .await?;
                Err(e.into())
            }
            Err(other) => Err(other),
        }
    }

    /// Apply `t` and persist the status, skipping the write (and the Event)
    /// when nothing moved.
    async fn record(&self, mut obj: CanonicalResource, t: Transition<'_>) -> Result<CanonicalResource, StoreError> {
        let before = obj.status.clone();
        t.apply_to(&mut obj);
        if obj.status == before {
            return Ok(obj);
        }
        let out = self.store.update_status(&obj).await?;
        debug!(state = %t.state, rv = ?out.metadata.resource_version, "status recorded");
        if let Some(events) = &self.events {
            events.publish(&out, t.event_type(), t.reason, t.action, t.message).await;
        }
        Ok(out)
    }

    async fn run_step(
        &self,
        kind: StepKind,
        spec: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let fut = match kind {
            StepKind::Apply => self.steps.apply(spec),
            StepKind::Cleanup => self.steps.cleanup(spec),
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(step = %kind, "step abandoned on shutdown");
                Err(ReconcileError::Cancelled)
            }
            res = tokio::time::timeout(self.cfg.step_timeout, fut) => match res {
                Ok(result) => result.map_err(ReconcileError::from),
                Err(_) => Err(StepError::new(
                    reason::TIMEOUT,
                    format!("{} step did not finish within {}s", kind, self.cfg.step_timeout.as_secs()),
                )
                .into()),
            },
        }
    }
}
