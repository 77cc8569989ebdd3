//! Kubernetes-backed port implementations
//!
//! Reflector stores serve the lister ports; the ClusterNode updater writes
//! through the API with conflict retry.

use crate::crd::ClusterNode;
use crate::domain::{ClusterNodeLister, ClusterNodeUpdater, NodeLister};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Listers
// =============================================================================

/// ClusterNode lister over a reflector store
#[derive(Clone)]
pub struct KubeClusterNodes(pub Store<ClusterNode>);

impl ClusterNodeLister for KubeClusterNodes {
    fn get(&self, name: &str) -> Option<ClusterNode> {
        self.0.get(&ObjectRef::new(name)).map(|cn| (*cn).clone())
    }

    fn list(&self) -> Vec<ClusterNode> {
        self.0.state().iter().map(|cn| (**cn).clone()).collect()
    }
}

/// Node lister over a reflector store
#[derive(Clone)]
pub struct KubeNodes(pub Store<Node>);

impl NodeLister for KubeNodes {
    fn exists(&self, name: &str) -> bool {
        self.0.get(&ObjectRef::new(name)).is_some()
    }
}

/// Drive a reflector stream until cancelled, calling `on_event` per event
pub async fn drive_watch<K, S, F>(
    stream: S,
    kind: &'static str,
    cancel: CancellationToken,
    mut on_event: F,
) where
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>> + Send,
    F: FnMut(&watcher::Event<K>) + Send,
{
    let mut stream = std::pin::pin!(stream.default_backoff());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => on_event(&event),
                Some(Err(e)) => warn!(kind, error = %e, "Watch error"),
                None => break,
            },
        }
    }
    debug!(kind, "Watch stopped");
}

// =============================================================================
// Updater
// =============================================================================

const UPDATE_MAX_ELAPSED: Duration = Duration::from_secs(10);

/// Writes `spec.podCIDRs` with get/replace, retrying on 409
#[derive(Clone)]
pub struct KubeClusterNodeUpdater {
    api: Api<ClusterNode>,
}

impl KubeClusterNodeUpdater {
    pub fn new(api: Api<ClusterNode>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClusterNodeUpdater for KubeClusterNodeUpdater {
    async fn update_pod_cidrs(&self, name: &str, pod_cidrs: Vec<String>) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_elapsed_time(Some(UPDATE_MAX_ELAPSED))
            .build();

        backoff::future::retry(policy, || {
            let api = self.api.clone();
            let name = name.to_string();
            let pod_cidrs = pod_cidrs.clone();
            async move {
                let mut current = api
                    .get(&name)
                    .await
                    .map_err(|e| backoff::Error::permanent(Error::from(e)))?;
                if current.spec.pod_cidrs == pod_cidrs {
                    return Ok(());
                }
                current.spec.pod_cidrs = pod_cidrs;
                match api.replace(&name, &PostParams::default(), &current).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        let e = Error::from(e);
                        if !e.is_conflict() {
                            return Err(backoff::Error::permanent(e));
                        }
                        debug!(clusternode = %name, "Update conflict, retrying");
                        Err(backoff::Error::transient(Error::Conflict {
                            kind: "ClusterNode".into(),
                            name,
                        }))
                    }
                }
            }
        })
        .await
    }
}
