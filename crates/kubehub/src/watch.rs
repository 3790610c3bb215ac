//! Per-kind list+watch turning kube watcher output into typed event pairs.

use acm_core::{KindEvent, ObjectEvent};
use futures::{future, stream, Stream, StreamExt};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

fn cache_key(obj: &DynamicObject) -> String {
    match obj.metadata.uid.as_deref() {
        Some(uid) => uid.to_string(),
        None => format!(
            "{}/{}",
            obj.metadata.namespace.as_deref().unwrap_or(""),
            obj.metadata.name.as_deref().unwrap_or("")
        ),
    }
}

/// Last seen version of every object on one watch. The kube watcher reports
/// only the current object; the cache supplies the old side of updates.
#[derive(Default)]
pub struct EventCache {
    seen: FxHashMap<String, DynamicObject>,
}

impl EventCache {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }

    pub fn applied(&mut self, obj: DynamicObject) -> ObjectEvent {
        match self.seen.insert(cache_key(&obj), obj.clone()) {
            Some(old) => ObjectEvent::Update { old, new: obj },
            None => ObjectEvent::Create(obj),
        }
    }

    pub fn deleted(&mut self, obj: DynamicObject) -> ObjectEvent {
        self.seen.remove(&cache_key(&obj));
        ObjectEvent::Delete(obj)
    }

    pub fn apply(&mut self, event: Event<DynamicObject>) -> Vec<ObjectEvent> {
        match event {
            Event::Applied(o) => vec![self.applied(o)],
            Event::Deleted(o) => vec![self.deleted(o)],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                self.restarted(list)
            }
        }
    }

    /// A relist: objects missing from it were deleted while the watch was down.
    pub fn restarted(&mut self, objs: Vec<DynamicObject>) -> Vec<ObjectEvent> {
        let live: FxHashSet<String> = objs.iter().map(cache_key).collect();
        let gone: Vec<String> = self.seen.keys().filter(|k| !live.contains(*k)).cloned().collect();
        let mut out = Vec::with_capacity(objs.len() + gone.len());
        for key in gone {
            if let Some(old) = self.seen.remove(&key) {
                out.push(ObjectEvent::Delete(old));
            }
        }
        for obj in objs {
            out.push(self.applied(obj));
        }
        out
    }
}

/// Typed event pairs for a raw watcher stream. Errors pass through untouched.
pub fn object_events<W>(stream: W) -> impl Stream<Item = Result<ObjectEvent, watcher::Error>> + Send
where
    W: Stream<Item = Result<Event<DynamicObject>, watcher::Error>> + Send,
{
    let mut cache = EventCache::new();
    stream
        .map(move |item| match item {
            Ok(ev) => cache.apply(ev).into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
        .flat_map(stream::iter)
}

/// List+watch one kind across all namespaces as typed events. Stream errors
/// are logged and retried with backoff; the stream itself never ends.
pub fn watch_kind(client: Client, gvk_key: String, ar: ApiResource) -> impl Stream<Item = KindEvent> + Send + 'static {
    let api: Api<DynamicObject> = Api::all_with(client, &ar);
    info!(gvk = %gvk_key, "watcher started");
    object_events(watcher::watcher(api, watcher::Config::default()).default_backoff()).filter_map(move |item| {
        let out = match item {
            Ok(event) => Some(KindEvent { gvk: gvk_key.clone(), event }),
            Err(e) => {
                metrics::counter!("watch_errors_total", 1u64, "gvk" => gvk_key.clone());
                warn!(gvk = %gvk_key, error = %e, "watch error; backing off");
                None
            }
        };
        future::ready(out)
    })
}
