use crate::config::Config;
use crate::crd::SyncResult;
use crate::events::Counters;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) shared: SharedState,
    pub(crate) shutdown: CancellationToken,
    /// Held by the running reconciliation pass.
    pub(crate) pass_lock: Arc<Mutex<()>>,
}

/// State read by the web server and written by reconciliation passes.
#[derive(Clone, Default)]
pub struct SharedState {
    pub(crate) counters: Arc<Counters>,
    /// Latest results per ContainerVersion, keyed by `namespace/name`.
    resources: Arc<RwLock<BTreeMap<String, Vec<SyncResult>>>>,
}

impl SharedState {
    pub async fn set_resources(&self, namespace: &str, name: &str, results: Vec<SyncResult>) {
        self.resources
            .write()
            .await
            .insert(format!("{}/{}", namespace, name), results);
    }

    /// Drops results of ContainerVersions that no longer exist.
    pub async fn retain_resources(&self, keep: &[String]) {
        self.resources
            .write()
            .await
            .retain(|key, _| keep.contains(key));
    }

    pub async fn resources(&self) -> Vec<SyncResult> {
        self.resources
            .read()
            .await
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}
