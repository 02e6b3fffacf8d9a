//! Kube integration: the OnionService CRD, a single-resource watcher that
//! feeds the work queue, and the status write-back path.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use futures::StreamExt;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::watcher::{self, Event},
    Client, CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onion_core::ObjectKey;
use onion_queue::WorkQueue;

/// Port mapping exposed by the onion service: `public_port` is what
/// clients dial on the .onion address, `target_port` is where the daemon
/// forwards the traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub public_port: u16,
    pub target_port: u16,
}

/// Reference to a secret holding the hidden service private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub key: String,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tor.k8s.io",
    version = "v1alpha1",
    kind = "OnionService",
    namespaced,
    status = "OnionServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OnionServiceSpec {
    /// Hidden service protocol version, 2 or 3.
    #[serde(default = "default_version")]
    pub version: u8,
    pub ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_secret: Option<SecretReference>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

fn default_version() -> u8 {
    3
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OnionServiceStatus {
    /// The .onion hostname the daemon derived after startup.
    #[serde(default)]
    pub hostname: String,
    /// Cluster IP of the backing service; rendered into the config as the
    /// port mapping target.
    #[serde(default)]
    pub target_cluster_ip: String,
}

/// Last-observed body of the watched resource. Written only by the
/// watcher task; read lock-free by sync workers. Entries are replaced
/// whole, never mutated in place, so readers always see a consistent
/// object.
#[derive(Default)]
pub struct DesiredCache {
    slot: ArcSwapOption<OnionService>,
}

impl DesiredCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> Option<Arc<OnionService>> {
        self.slot.load_full()
    }

    pub fn store(&self, obj: OnionService) {
        self.slot.store(Some(Arc::new(obj)));
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}

/// Watch exactly one OnionService (server-side field selector on the
/// name) and translate every event into a debounced enqueue. The queue
/// carries keys only; workers re-read the cache at processing time, so a
/// stale enqueue can never apply a stale body.
pub async fn run_watcher(
    client: Client,
    key: ObjectKey,
    cache: Arc<DesiredCache>,
    queue: Arc<WorkQueue>,
    settle: Duration,
    cancel: CancellationToken,
) {
    let api: Api<OnionService> = Api::namespaced(client, &key.namespace);
    let cfg = watcher::Config::default().fields(&format!("metadata.name={}", key.name));
    let mut stream = watcher::watcher(api, cfg).boxed();
    let key_str = key.to_string();
    info!(key = %key_str, "watcher started");

    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(Event::Applied(obj))) => {
                debug!(key = %key_str, "resource applied");
                cache.store(obj);
                queue.add_after(&key_str, settle);
            }
            Some(Ok(Event::Deleted(_))) => {
                info!(key = %key_str, "resource deleted");
                cache.clear();
                queue.add_after(&key_str, settle);
            }
            Some(Ok(Event::Restarted(list))) => {
                // Relist replaces the cache wholesale; with a name field
                // selector there is at most one object.
                debug!(count = list.len(), "watch restarted");
                match list.into_iter().last() {
                    Some(obj) => cache.store(obj),
                    None => cache.clear(),
                }
                queue.add_after(&key_str, settle);
            }
            Some(Err(e)) => {
                // The watcher re-establishes the subscription itself;
                // individual notifications are never retried here.
                warn!(error = %e, "watch error; stream will resume");
            }
            None => {
                warn!("watch stream ended");
                break;
            }
        }
    }
    info!(key = %key_str, "watcher stopped");
}

/// Pushes observed status values back to the control plane.
pub struct KubeStatusWriter {
    api: Api<OnionService>,
}

impl KubeStatusWriter {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace) }
    }

    pub async fn publish_hostname(&self, name: &str, hostname: &str) -> Result<()> {
        let patch = serde_json::json!({ "status": { "hostname": hostname } });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching status of {name}"))?;
        Ok(())
    }
}
