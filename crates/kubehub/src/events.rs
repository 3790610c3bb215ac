//! Kubernetes Events for the canonical resource.
//!
//! Publishing is fire-and-forget: a failed Event is logged and never fails a
//! reconcile.

use std::sync::Mutex;

use acm_core::CanonicalResource;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::ApiResource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `obj`. `reason` is the condition reason and
    /// `note` its message.
    async fn publish(&self, obj: &CanonicalResource, type_: EventType, reason: &str, action: &str, note: &str);
}

/// Publishes through `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    ar: ApiResource,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the Event's reporting component.
    pub fn new(client: Client, ar: ApiResource, controller_name: &str) -> Self {
        let reporter = Reporter { controller: controller_name.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, ar, reporter }
    }

    fn reference(&self, obj: &CanonicalResource) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.ar.api_version.clone()),
            kind: Some(self.ar.kind.clone()),
            name: obj.metadata.name.clone(),
            namespace: obj.metadata.namespace.clone(),
            uid: obj.metadata.uid.clone(),
            resource_version: obj.metadata.resource_version.clone(),
            ..ObjectReference::default()
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, obj: &CanonicalResource, type_: EventType, reason: &str, action: &str, note: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), self.reference(obj));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, action, error = %e, "failed to publish event");
            metrics::counter!("event_publish_errors_total", 1u64);
        }
    }
}

/// One Event captured by [`MemoryEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub note: String,
    pub object: String,
}

/// Records Events in memory for tests.
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<PublishedEvent>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PublishedEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEvents {
    async fn publish(&self, obj: &CanonicalResource, type_: EventType, reason: &str, action: &str, note: &str) {
        let object = match (&obj.metadata.namespace, &obj.metadata.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        if let Ok(mut g) = self.events.lock() {
            g.push(PublishedEvent {
                type_,
                reason: reason.to_string(),
                action: action.to_string(),
                note: note.to_string(),
                object,
            });
        }
    }
}
