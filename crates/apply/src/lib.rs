//! ACM apply: the default install step.
//!
//! Loads the managed objects from a multi-document YAML manifest, stamps the
//! ownership label on each, server-side applies them and reads them back to
//! verify. Cleanup deletes them again in reverse order.

#![forbid(unsafe_code)]

use std::path::Path;
use std::time::Instant;

use acm_core::{reason, PART_OF_LABEL};
use acm_kubehub::Resolver;
use acm_reconcile::{InstallStep, StepError};
use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "application-connector-manager";

fn max_yaml_bytes() -> usize {
    std::env::var("ACM_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(4_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("ACM_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(200_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every non-empty document of `yaml` into a dynamic object labelled
/// `app.kubernetes.io/part-of=<part_of>`.
pub fn parse_manifest(yaml: &str, part_of: &str) -> Result<Vec<DynamicObject>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting document {} to JSON", idx))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("document {} too complex (>{} nodes)", idx, max_yaml_nodes()));
        }
        for field in ["apiVersion", "kind"] {
            if json.get(field).and_then(Json::as_str).map_or(true, str::is_empty) {
                return Err(anyhow!("document {} missing {}", idx, field));
            }
        }
        if json.pointer("/metadata/name").and_then(Json::as_str).map_or(true, str::is_empty) {
            return Err(anyhow!("document {} missing metadata.name", idx));
        }
        let mut obj: DynamicObject =
            serde_json::from_value(json).with_context(|| format!("decoding document {} as an object", idx))?;
        obj.metadata.labels.get_or_insert_with(Default::default).insert(PART_OF_LABEL.to_string(), part_of.to_string());
        out.push(obj);
    }
    Ok(out)
}

pub fn load_manifest(path: &Path, part_of: &str) -> Result<Vec<DynamicObject>> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path.display()))?;
    parse_manifest(&yaml, part_of).with_context(|| format!("loading manifest {}", path.display()))
}

/// Namespaced objects without a namespace land in `default_ns`; cluster-scoped ones lose theirs.
fn place(obj: &mut DynamicObject, namespaced: bool, default_ns: &str) {
    if !namespaced {
        obj.metadata.namespace = None;
    } else if obj.metadata.namespace.as_deref().map_or(true, str::is_empty) {
        obj.metadata.namespace = Some(default_ns.to_string());
    }
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?");
    let name = obj.metadata.name.as_deref().unwrap_or("");
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{} {}/{}", kind, ns, name),
        None => format!("{} {}", kind, name),
    }
}

struct Target {
    obj: DynamicObject,
    ar: ApiResource,
    namespaced: bool,
}

impl Target {
    fn name(&self) -> &str { self.obj.metadata.name.as_deref().unwrap_or_default() }
}

pub struct ManifestInstaller {
    client: Client,
    targets: Vec<Target>,
}

impl ManifestInstaller {
    /// Resolve every object's API resource up front, so unknown kinds fail at startup.
    pub fn new(client: Client, resolver: &Resolver, objects: Vec<DynamicObject>, default_ns: &str) -> Result<Self> {
        let mut targets = Vec::with_capacity(objects.len());
        for mut obj in objects {
            let types = obj.types.as_ref().ok_or_else(|| anyhow!("{} has no apiVersion/kind", describe(&obj)))?;
            let key = format!("{}/{}", types.api_version, types.kind);
            let gvk = acm_core::parse_gvk_key(&key)?;
            let (ar, namespaced) = resolver.resolve(&gvk).with_context(|| format!("resolving {}", describe(&obj)))?;
            place(&mut obj, namespaced, default_ns);
            targets.push(Target { obj, ar, namespaced });
        }
        info!(objects = targets.len(), "manifest installer ready");
        Ok(Self { client, targets })
    }

    pub fn objects(&self) -> impl Iterator<Item = &DynamicObject> { self.targets.iter().map(|t| &t.obj) }

    fn api(&self, t: &Target) -> Api<DynamicObject> {
        match (t.namespaced, t.obj.metadata.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &t.ar),
            _ => Api::all_with(self.client.clone(), &t.ar),
        }
    }
}

/// Applies the static manifest; the canonical spec is not consulted.
#[async_trait::async_trait]
impl InstallStep for ManifestInstaller {
    async fn apply(&self, _spec: &Json) -> Result<(), StepError> {
        let t0 = Instant::now();
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        for t in &self.targets {
            if let Err(e) = self.api(t).patch(t.name(), &pp, &Patch::Apply(&t.obj)).await {
                counter!("apply_err", 1u64);
                return Err(StepError::new(reason::APPLY_OBJ_ERROR, format!("applying {}: {}", describe(&t.obj), e)));
            }
            debug!(object = %describe(&t.obj), "applied");
        }
        for t in &self.targets {
            match self.api(t).get_opt(t.name()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(StepError::new(reason::VERIFICATION_ERR, format!("{} not found after apply", describe(&t.obj))))
                }
                Err(e) => {
                    return Err(StepError::new(reason::VERIFICATION_ERR, format!("verifying {}: {}", describe(&t.obj), e)))
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        Ok(())
    }

    async fn cleanup(&self, _spec: &Json) -> Result<(), StepError> {
        for t in self.targets.iter().rev() {
            match self.api(t).delete(t.name(), &DeleteParams::default()).await {
                Ok(_) => debug!(object = %describe(&t.obj), "deleted"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(StepError::new(reason::DELETION_ERR, format!("deleting {}: {}", describe(&t.obj), e)))
                }
            }
        }
        Ok(())
    }
}
