//! acm-operator: watches the managed kinds, redirects their events to the
//! canonical resource and reconciles it with the manifest installer.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use acm_apply::ManifestInstaller;
use acm_dispatch::WatchDispatcher;
use acm_kubehub::{watch_kind, KubeEventPublisher, KubeStore, Resolver};
use acm_reconcile::Reconciler;
use anyhow::{Context as _, Result};
use clap::Parser;
use futures::{stream, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

/// Reporting component on published Events.
const CONTROLLER_NAME: &str = "application-connector-manager";

fn init_tracing() {
    let env = std::env::var("ACM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ACM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ACM_METRICS_ADDR; expected host:port");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Ctrl-C received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cfg = Config::parse();
    cfg.validate()?;
    info!(canonical = %cfg.canonical_gvk, manifest = %cfg.manifest.display(), workers = cfg.workers, "starting");

    let client = Client::try_default().await.context("building kube client")?;
    let resolver = Resolver::new(client.clone()).await.context("running API discovery")?;
    let (canonical_ar, _) = resolver.resolve(&acm_core::parse_gvk_key(&cfg.canonical_gvk)?)?;
    let store = Arc::new(KubeStore::resolve(client.clone(), &resolver, &cfg.canonical_gvk)?);

    let objects = acm_apply::load_manifest(&cfg.manifest, &cfg.part_of)?;
    let installer = Arc::new(ManifestInstaller::new(client.clone(), &resolver, objects, &cfg.namespace)?);

    let mut dispatcher = WatchDispatcher::new(store.clone(), &cfg.canonical_gvk, &cfg.part_of)?;
    let added = dispatcher.register_distinct(installer.objects())?;
    info!(kinds = added, "managed kinds registered");
    let dispatcher = Arc::new(dispatcher);

    let mut managed = Vec::new();
    for reg in dispatcher.registrations() {
        let (ar, _) = resolver.resolve(&acm_core::parse_gvk_key(&reg.gvk)?)?;
        managed.push(watch_kind(client.clone(), reg.gvk.clone(), ar).boxed());
    }
    let redirects = dispatcher.clone().redirects(stream::select_all(managed));

    let writer = reflector::store::Writer::<DynamicObject>::new(canonical_ar.clone());
    let reader = writer.as_reader();
    let canonical_api: Api<DynamicObject> = Api::all_with(client.clone(), &canonical_ar);
    let raw = watcher::watcher(canonical_api, watcher::Config::default()).default_backoff().reflect(writer);
    let triggers = acm_runner::canonical_triggers(dispatcher.clone(), raw);

    let events = Arc::new(KubeEventPublisher::new(client.clone(), canonical_ar.clone(), CONTROLLER_NAME));
    let reconciler = Reconciler::new(store, installer, cfg.reconciler()).with_events(events);
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let ctx = Arc::new(acm_runner::Context::new(reconciler, shutdown, cfg.retry_after()));
    acm_runner::controller(reader, canonical_ar, triggers, redirects, ctx, cfg.workers).await;
    info!("stopped");
    Ok(())
}
