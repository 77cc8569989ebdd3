//! Calico CNI adapter
//!
//! Watches Calico `BlockAffinity` objects in the member cluster. A node's pod
//! CIDRs are the CIDRs of every block affine to it.

use crate::domain::{cidrs_for_node, BlockAffinity, CniAdapter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADAPTER_NAME: &str = "calico";

const BLOCK_AFFINITY_GROUP: &str = "crd.projectcalico.org";
const BLOCK_AFFINITY_VERSION: &str = "v1";
const BLOCK_AFFINITY_KIND: &str = "BlockAffinity";
const BLOCK_AFFINITY_PLURAL: &str = "blockaffinities";

/// API resource of Calico block affinities
pub fn block_affinity_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(
        BLOCK_AFFINITY_GROUP,
        BLOCK_AFFINITY_VERSION,
        BLOCK_AFFINITY_KIND,
    );
    ApiResource::from_gvk_with_plural(&gvk, BLOCK_AFFINITY_PLURAL)
}

/// Extract `spec.node`/`spec.cidr`; `None` for malformed or deleted affinities
pub fn block_affinity_from_object(obj: &DynamicObject) -> Option<BlockAffinity> {
    let spec = obj.data.get("spec")?;
    if spec.get("deleted").and_then(|d| d.as_str()) == Some("true") {
        return None;
    }
    let node = spec.get("node")?.as_str()?;
    let cidr = spec.get("cidr")?.as_str()?;
    if node.is_empty() || cidr.is_empty() {
        return None;
    }
    Some(BlockAffinity {
        node: node.to_string(),
        cidr: cidr.to_string(),
    })
}

fn touched_nodes(event: &watcher::Event<DynamicObject>) -> (Vec<String>, bool) {
    let node_of = |obj: &DynamicObject| {
        obj.data
            .get("spec")
            .and_then(|s| s.get("node"))
            .and_then(|n| n.as_str())
            .map(String::from)
    };
    match event {
        watcher::Event::Applied(obj) | watcher::Event::Deleted(obj) => {
            (node_of(obj).into_iter().collect(), false)
        }
        watcher::Event::Restarted(objs) => (objs.iter().filter_map(node_of).collect(), true),
    }
}

/// Adapter backed by a dynamic BlockAffinity reflector
pub struct CalicoAdapter {
    api: Api<DynamicObject>,
    store: Store<DynamicObject>,
    writer: Mutex<Option<Writer<DynamicObject>>>,
    synced: Arc<AtomicBool>,
    events: mpsc::Sender<String>,
}

impl CalicoAdapter {
    pub fn new(client: Client, events: mpsc::Sender<String>) -> Self {
        let resource = block_affinity_resource();
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();
        Self {
            api: Api::all_with(client, &resource),
            store,
            writer: Mutex::new(Some(writer)),
            synced: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    fn affinities(&self) -> Vec<BlockAffinity> {
        self.store
            .state()
            .iter()
            .filter_map(|obj| block_affinity_from_object(obj))
            .collect()
    }
}

#[async_trait]
impl CniAdapter for CalicoAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn get_cidr_by_node_name(&self, node_name: &str) -> Result<Vec<String>> {
        if !self.synced() {
            return Err(Error::AdapterNotStarted {
                adapter: ADAPTER_NAME.into(),
            });
        }
        Ok(cidrs_for_node(&self.affinities(), node_name))
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
                    Err(e) => {
                        warn!(adapter = ADAPTER_NAME, error = %e, "BlockAffinity watch error")
                    }
                }
            }
            debug!(adapter = ADAPTER_NAME, "BlockAffinity watch stopped");
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
    use serde_json::json;

    fn affinity(name: &str, spec: serde_json::Value) -> DynamicObject {
        DynamicObject::new(name, &block_affinity_resource()).data(json!({ "spec": spec }))
    }

    #[test]
    fn test_block_affinity_from_object() {
        let obj = affinity(
            "node1-10-0-1-0-26",
            json!({"node": "node1", "cidr": "10.0.1.0/26", "state": "confirmed", "deleted": "false"}),
        );
        assert_eq!(
            block_affinity_from_object(&obj),
            Some(BlockAffinity {
                node: "node1".into(),
                cidr: "10.0.1.0/26".into()
            })
        );

        let deleted = affinity(
            "gone",
            json!({"node": "node1", "cidr": "10.0.1.64/26", "deleted": "true"}),
        );
        assert_eq!(block_affinity_from_object(&deleted), None);

        let no_cidr = affinity("broken", json!({"node": "node1"}));
        assert_eq!(block_affinity_from_object(&no_cidr), None);
    }

    #[test]
    fn test_touched_nodes() {
        let objs = vec![
            affinity("a", json!({"node": "node1", "cidr": "10.0.1.0/26"})),
            affinity("b", json!({"cidr": "10.0.2.0/26"})),
        ];
        assert_eq!(
            touched_nodes(&watcher::Event::Restarted(objs.clone())),
            (vec!["node1".to_string()], true)
        );
        assert_eq!(
            touched_nodes(&watcher::Event::Deleted(objs[0].clone())),
            (vec!["node1".to_string()], false)
        );
    }

    #[test]
    fn test_block_affinity_resource() {
        let resource = block_affinity_resource();
        assert_eq!(resource.group, "crd.projectcalico.org");
        assert_eq!(resource.plural, "blockaffinities");
        assert_eq!(resource.api_version, "crd.projectcalico.org/v1");
    }
}
