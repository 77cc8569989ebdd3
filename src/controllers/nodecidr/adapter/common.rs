//! Common CNI adapter
//!
//! Reads pod CIDRs straight from the member cluster's Node objects. Used for
//! every CNI that records its allocation in `spec.podCIDRs`.

use crate::domain::CniAdapter;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADAPTER_NAME: &str = "common";

/// Pod CIDRs of a node, falling back to the single-stack field
pub fn node_pod_cidrs(node: &Node) -> Vec<String> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };
    match (&spec.pod_cidrs, &spec.pod_cidr) {
        (Some(cidrs), _) if !cidrs.is_empty() => cidrs.clone(),
        (_, Some(cidr)) if !cidr.is_empty() => vec![cidr.clone()],
        _ => Vec::new(),
    }
}

/// Names of the nodes an event touches; `true` when it is a full relist
fn touched_nodes(event: &watcher::Event<Node>) -> (Vec<String>, bool) {
    match event {
        watcher::Event::Applied(node) | watcher::Event::Deleted(node) => {
            (vec![node.name_any()], false)
        }
        watcher::Event::Restarted(nodes) => (nodes.iter().map(|n| n.name_any()).collect(), true),
    }
}

/// Adapter backed by a Node reflector
pub struct CommonAdapter {
    api: Api<Node>,
    store: Store<Node>,
    writer: Mutex<Option<Writer<Node>>>,
    synced: Arc<AtomicBool>,
    events: mpsc::Sender<String>,
}

impl CommonAdapter {
    pub fn new(client: Client, events: mpsc::Sender<String>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api: Api::all(client),
            store,
            writer: Mutex::new(Some(writer)),
            synced: Arc::new(AtomicBool::new(false)),
            events,
        }
    }
}

#[async_trait]
impl CniAdapter for CommonAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn get_cidr_by_node_name(&self, node_name: &str) -> Result<Vec<String>> {
        if !self.synced() {
            return Err(Error::AdapterNotStarted {
                adapter: ADAPTER_NAME.into(),
            });
        }
        Ok(self
            .store
            .get(&ObjectRef::new(node_name))
            .map(|node| node_pod_cidrs(&node))
            .unwrap_or_default())
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let writer = self.writer.lock().take().ok_or_else(|| Error::Adapter {
            adapter: ADAPTER_NAME.into(),
            reason: "already started".into(),
        })?;

        let mut stream = reflector::reflector(
            writer,
            watcher::watcher(self.api.clone(), watcher::Config::default()),
        )
        .default_backoff()
        .boxed();
        let synced = Arc::clone(&self.synced);
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    Ok(event) => {
                        let (nodes, restarted) = touched_nodes(&event);
                        if restarted {
                            synced.store(true, Ordering::SeqCst);
                        }
                        for node in nodes {
                            if events.send(node).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(adapter = ADAPTER_NAME, error = %e, "Node watch error"),
                }
            }
            debug!(adapter = ADAPTER_NAME, "Node watch stopped");
        });

        info!(adapter = ADAPTER_NAME, "CNI adapter started");
        Ok(())
    }

    fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;

    fn k8s_node(name: &str, cidr: Option<&str>, cidrs: Option<Vec<&str>>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: cidr.map(String::from),
                pod_cidrs: cidrs.map(|c| c.into_iter().map(String::from).collect()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_node_pod_cidrs() {
        let dual = k8s_node("n1", Some("10.0.1.0/24"), Some(vec!["10.0.1.0/24", "fd00:1::/64"]));
        assert_eq!(node_pod_cidrs(&dual), vec!["10.0.1.0/24", "fd00:1::/64"]);

        let single = k8s_node("n2", Some("10.0.2.0/24"), None);
        assert_eq!(node_pod_cidrs(&single), vec!["10.0.2.0/24"]);

        let none = k8s_node("n3", None, Some(vec![]));
        assert!(node_pod_cidrs(&none).is_empty());
    }

    #[test]
    fn test_touched_nodes() {
        let applied = watcher::Event::Applied(k8s_node("n1", None, None));
        assert_eq!(touched_nodes(&applied), (vec!["n1".to_string()], false));

        let restarted = watcher::Event::Restarted(vec![
            k8s_node("n1", None, None),
            k8s_node("n2", None, None),
        ]);
        assert_eq!(
            touched_nodes(&restarted),
            (vec!["n1".to_string(), "n2".to_string()], true)
        );
    }
}
