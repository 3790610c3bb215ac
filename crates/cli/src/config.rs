use std::path::PathBuf;
use std::time::Duration;

use acm_reconcile::ReconcilerConfig;
use anyhow::{anyhow, Result};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "acm-operator", version, about = "Application connector manager")]
pub struct Config {
    /// Multi-document YAML with the managed objects
    #[arg(long, env = "ACM_MANIFEST")]
    pub manifest: PathBuf,

    /// GVK key of the canonical resource
    #[arg(long, env = "ACM_CANONICAL_GVK", default_value = "operator.kyma-project.io/v1alpha1/ApplicationConnector")]
    pub canonical_gvk: String,

    /// Namespace for namespaced manifest objects that do not name one
    #[arg(long, env = "ACM_NAMESPACE", default_value = "kyma-system")]
    pub namespace: String,

    #[arg(long, env = "ACM_FINALIZER", default_value = acm_core::DEFAULT_FINALIZER)]
    pub finalizer: String,

    /// Value of the app.kubernetes.io/part-of label on managed objects
    #[arg(long, env = "ACM_PART_OF", default_value = acm_core::DEFAULT_PART_OF)]
    pub part_of: String,

    /// Reconciles allowed in flight at once; one object never runs twice concurrently
    #[arg(long, env = "ACM_WORKERS", default_value_t = 2)]
    pub workers: u16,

    /// Upper bound for one install or cleanup step
    #[arg(long, env = "ACM_STEP_TIMEOUT_SECS", default_value_t = 300)]
    pub step_timeout_secs: u64,

    /// Delay before a failed reconcile runs again
    #[arg(long, env = "ACM_RETRY_SECS", default_value_t = 10)]
    pub retry_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("--step-timeout-secs must be at least 1"));
        }
        if self.retry_secs == 0 {
            return Err(anyhow!("--retry-secs must be at least 1"));
        }
        acm_core::parse_gvk_key(&self.canonical_gvk)?;
        Ok(())
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig { finalizer: self.finalizer.clone(), step_timeout: Duration::from_secs(self.step_timeout_secs) }
    }
}
