//! ACM kubehub – discovery, object store and watcher wiring

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::debug;

pub mod events;
pub mod kube_store;
pub mod memory;
pub mod store;
pub mod watch;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use store::{ResourceStore, StoreError};
pub use events::{EventPublisher, KubeEventPublisher, MemoryEvents, PublishedEvent};
pub use watch::{object_events, watch_kind, EventCache};

/// Runs API discovery once and resolves GVKs against the served resources.
pub struct Resolver {
    discovery: Discovery,
}

impl Resolver {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client).run().await?;
        Ok(Self { discovery })
    }

    /// Returns the API resource and whether it is namespaced.
    pub fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        for group in self.discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = %acm_core::gvk_key(gvk), plural = %ar.plural, namespaced, "resolved api resource");
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}
