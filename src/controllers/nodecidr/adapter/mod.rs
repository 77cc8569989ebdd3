//! CNI adapters
//!
//! Each adapter discovers the pod CIDRs the member cluster's CNI handed out
//! and reports the names of Kubernetes nodes whose allocation changed. The
//! requeue dispatcher maps those names onto ClusterNode keys.

pub mod calico;
pub mod calico_etcd;
pub mod common;

pub use calico::CalicoAdapter;
pub use calico_etcd::{CalicoEtcdAdapter, EtcdBlockAffinityDatastore, EtcdDatastoreConfig};
pub use common::CommonAdapter;

use crate::controllers::worker::AsyncWorker;
use crate::domain::ClusterNodeLister;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the channel between an adapter and the dispatcher
pub const EVENT_BUFFER: usize = 100;

/// CNI whose IPAM state is read from Calico block affinities
pub const CALICO_CNI: &str = "calico";

/// Which adapter serves a member cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Core Node `spec.podCIDRs`
    Common,
    /// Calico block affinities stored as CRDs
    Calico,
    /// Calico block affinities stored in etcd
    CalicoEtcd,
}

/// Choose the adapter for a cluster's CNI
pub fn select_adapter(cni: &str, etcd_configured: bool) -> AdapterKind {
    match (cni, etcd_configured) {
        (CALICO_CNI, true) => AdapterKind::CalicoEtcd,
        (CALICO_CNI, false) => AdapterKind::Calico,
        _ => AdapterKind::Common,
    }
}

/// Queue key for an adapter event about `node_name`.
///
/// The ClusterNode of `cluster_name` that mirrors the node when one is known,
/// the bare node name otherwise so the reconcile can decide what to do.
pub fn requeue_key(cluster_name: &str, lister: &dyn ClusterNodeLister, node_name: &str) -> String {
    lister
        .list()
        .into_iter()
        .find(|cn| cn.spec.cluster_name == cluster_name && cn.spec.node_name == node_name)
        .map(|cn| cn.name().to_string())
        .unwrap_or_else(|| node_name.to_string())
}

/// Forward adapter events into the work queue until cancelled
pub async fn dispatch_requeues(
    mut events: mpsc::Receiver<String>,
    cluster_name: String,
    lister: Arc<dyn ClusterNodeLister>,
    worker: Arc<AsyncWorker>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(node_name) => {
                    let key = requeue_key(&cluster_name, lister.as_ref(), &node_name);
                    debug!(node = %node_name, key = %key, "Requeue from CNI adapter");
                    worker.add(key);
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fakes::FakeClusterNodes;
    use crate::network::filter::tests::node;
    use std::time::Duration;

    #[test]
    fn test_select_adapter() {
        assert_eq!(select_adapter("calico", false), AdapterKind::Calico);
        assert_eq!(select_adapter("calico", true), AdapterKind::CalicoEtcd);
        assert_eq!(select_adapter("flannel", true), AdapterKind::Common);
        assert_eq!(select_adapter("", false), AdapterKind::Common);
    }

    #[test]
    fn test_requeue_key_resolves_own_cluster_only() {
        let lister = FakeClusterNodes::with(vec![
            node("a", "n1", "192.168.1.1", false),
            node("b", "n2", "192.168.2.1", false),
        ]);
        assert_eq!(requeue_key("a", &lister, "n1"), "a-n1");
        assert_eq!(requeue_key("a", &lister, "n2"), "n2");
        assert_eq!(requeue_key("a", &lister, "unknown"), "unknown");
    }

    #[tokio::test]
    async fn test_dispatch_requeues() {
        let lister: Arc<dyn ClusterNodeLister> =
            Arc::new(FakeClusterNodes::with(vec![node("a", "n1", "192.168.1.1", false)]));
        let worker = Arc::new(AsyncWorker::new(Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let handle = tokio::spawn(dispatch_requeues(
            rx,
            "a".into(),
            lister,
            Arc::clone(&worker),
            cancel.clone(),
        ));
        tx.send("n1".into()).await.unwrap();
        tx.send("n1".into()).await.unwrap();
        tx.send("ghost".into()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(worker.len(), 2);
    }
}
