//! Calico etcd adapter
//!
//! For Calico installations whose datastore is etcd rather than the
//! Kubernetes API. Block affinities are read through the etcd v3 JSON
//! gateway and polled; hosts whose affinities changed between two listings
//! are reported to the dispatcher.

use crate::domain::{cidrs_for_node, BlockAffinity, BlockAffinityDatastore, CniAdapter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ADAPTER_NAME: &str = "calico-etcd";

/// Key prefix of Calico's per-host IPAM affinities
pub const DEFAULT_KEY_PREFIX: &str = "/calico/ipam/v2/host/";

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings of a Calico etcd datastore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdDatastoreConfig {
    /// Gateway base URLs, tried in order (e.g. `http://10.0.0.1:2379`)
    pub endpoints: Vec<String>,
    pub key_prefix: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for EtcdDatastoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

// =============================================================================
// etcd Datastore
// =============================================================================

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct AffinityValue {
    #[serde(default)]
    deleted: bool,
}

/// End of the etcd range covering every key under `prefix`
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace
    vec![0]
}

/// Parse `<prefix><host>/<ipv4|ipv6>/block/<cidr with '/' as '-'>`
pub fn parse_affinity_key(prefix: &str, key: &str) -> Option<BlockAffinity> {
    let rest = key.strip_prefix(prefix)?;
    let parts: Vec<&str> = rest.split('/').collect();
    let [host, family, "block", block] = parts.as_slice() else {
        return None;
    };
    if host.is_empty() || !matches!(*family, "ipv4" | "ipv6") {
        return None;
    }
    let (addr, len) = block.rsplit_once('-')?;
    if addr.is_empty() || len.parse::<u8>().is_err() {
        return None;
    }
    Some(BlockAffinity {
        node: host.to_string(),
        cidr: format!("{}/{}", addr, len),
    })
}

/// Block affinities read through the etcd v3 JSON gateway
#[derive(Debug, Clone)]
pub struct EtcdBlockAffinityDatastore {
    client: reqwest::Client,
    config: EtcdDatastoreConfig,
}

impl EtcdBlockAffinityDatastore {
    pub fn new(config: EtcdDatastoreConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Configuration(
                "etcd datastore needs at least one endpoint".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn range(&self, endpoint: &str) -> Result<RangeResponse> {
        let request = RangeRequest {
            key: STANDARD.encode(self.config.key_prefix.as_bytes()),
            range_end: STANDARD.encode(prefix_range_end(&self.config.key_prefix)),
        };
        let url = format!("{}/v3/kv/range", endpoint.trim_end_matches('/'));
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(Error::Datastore(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    fn decode(&self, response: RangeResponse) -> Vec<BlockAffinity> {
        response
            .kvs
            .into_iter()
            .filter_map(|kv| {
                let key = String::from_utf8(STANDARD.decode(&kv.key).ok()?).ok()?;
                let value = STANDARD.decode(&kv.value).ok()?;
                let attrs: AffinityValue = serde_json::from_slice(&value).unwrap_or_default();
                if attrs.deleted {
                    return None;
                }
                parse_affinity_key(&self.config.key_prefix, &key)
            })
            .collect()
    }
}

#[async_trait]
impl BlockAffinityDatastore for EtcdBlockAffinityDatastore {
    async fn list_block_affinities(&self) -> Result<Vec<BlockAffinity>> {
        let mut last_error = None;
        for endpoint in &self.config.endpoints {
            match self.range(endpoint).await {
                Ok(response) => return Ok(self.decode(response)),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Datastore("no etcd endpoints".into())))
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Hosts whose set of affine blocks differs between two listings
pub fn changed_hosts(old: &[BlockAffinity], new: &[BlockAffinity]) -> BTreeSet<String> {
    fn by_host(list: &[BlockAffinity]) -> BTreeMap<&str, BTreeSet<&str>> {
        let mut map: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for ba in list {
            map.entry(ba.node.as_str()).or_default().insert(ba.cidr.as_str());
        }
        map
    }
    let (old, new) = (by_host(old), by_host(new));
    old.keys()
        .chain(new.keys())
        .filter(|host| old.get(*host) != new.get(*host))
        .map(|host| host.to_string())
        .collect()
}

#[derive(Debug, Default)]
struct Snapshot {
    affinities: RwLock<Vec<BlockAffinity>>,
    synced: AtomicBool,
}

impl Snapshot {
    /// List once, store the result and return the hosts that changed
    async fn refresh(&self, datastore: &dyn BlockAffinityDatastore) -> Result<BTreeSet<String>> {
        let mut listed = datastore.list_block_affinities().await?;
        listed.sort();
        let changed = changed_hosts(&self.affinities.read(), &listed);
        *self.affinities.write() = listed;
        self.synced.store(true, Ordering::SeqCst);
        Ok(changed)
    }
}

/// Adapter polling a Calico etcd datastore
pub struct CalicoEtcdAdapter {
    datastore: Arc<dyn BlockAffinityDatastore>,
    snapshot: Arc<Snapshot>,
    poll_interval: Duration,
    events: mpsc::Sender<String>,
}

impl CalicoEtcdAdapter {
    pub fn new(
        datastore: Arc<dyn BlockAffinityDatastore>,
        poll_interval: Duration,
        events: mpsc::Sender<String>,
    ) -> Self {
        Self {
            datastore,
            snapshot: Arc::new(Snapshot::default()),
            poll_interval,
            events,
        }
    }

    pub fn from_config(config: EtcdDatastoreConfig, events: mpsc::Sender<String>) -> Result<Self> {
        let poll_interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let datastore = EtcdBlockAffinityDatastore::new(config)?;
        Ok(Self::new(Arc::new(datastore), poll_interval, events))
    }
}

#[async_trait]
impl CniAdapter for CalicoEtcdAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn get_cidr_by_node_name(&self, node_name: &str) -> Result<Vec<String>> {
        if !self.synced() {
            return Err(Error::AdapterNotStarted {
                adapter: ADAPTER_NAME.into(),
            });
        }
        Ok(cidrs_for_node(&self.snapshot.affinities.read(), node_name))
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let datastore = Arc::clone(&self.datastore);
        let snapshot = Arc::clone(&self.snapshot);
        let events = self.events.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match snapshot.refresh(datastore.as_ref()).await {
                    Ok(changed) => {
                        for host in changed {
                            if events.send(host).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(adapter = ADAPTER_NAME, error = %e, "Listing block affinities failed")
                    }
                }
            }
            debug!(adapter = ADAPTER_NAME, "etcd poll stopped");
        });

        info!(adapter = ADAPTER_NAME, interval = ?self.poll_interval, "CNI adapter started");
        Ok(())
    }

    fn synced(&self) -> bool {
        self.snapshot.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fakes::FakeDatastore;
    use assert_matches::assert_matches;

    fn ba(node: &str, cidr: &str) -> BlockAffinity {
        BlockAffinity {
            node: node.into(),
            cidr: cidr.into(),
        }
    }

    #[test]
    fn test_parse_affinity_key() {
        let parse = |key: &str| parse_affinity_key(DEFAULT_KEY_PREFIX, key);
        assert_eq!(
            parse("/calico/ipam/v2/host/node1/ipv4/block/10.0.1.0-26"),
            Some(ba("node1", "10.0.1.0/26"))
        );
        assert_eq!(
            parse("/calico/ipam/v2/host/node1/ipv6/block/fd00:1::-122"),
            Some(ba("node1", "fd00:1::/122"))
        );
        assert_eq!(parse("/calico/ipam/v2/host/node1/ipv4/block/10.0.1.0"), None);
        assert_eq!(parse("/calico/ipam/v2/assignment/ipv4/block/10.0.1.0-26"), None);
        assert_eq!(parse("/calico/ipam/v2/host/node1/ipv5/block/10.0.1.0-26"), None);
    }

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/a/"), b"/a0".to_vec());
        assert_eq!(prefix_range_end("ab"), b"ac".to_vec());
    }

    #[test]
    fn test_decode_skips_deleted() {
        let datastore = EtcdBlockAffinityDatastore::new(EtcdDatastoreConfig {
            endpoints: vec!["http://127.0.0.1:2379".into()],
            ..Default::default()
        })
        .unwrap();
        let kv = |key: &str, value: &str| KeyValue {
            key: STANDARD.encode(key),
            value: STANDARD.encode(value),
        };
        let response = RangeResponse {
            kvs: vec![
                kv(
                    "/calico/ipam/v2/host/node1/ipv4/block/10.0.1.0-26",
                    r#"{"state":"confirmed","deleted":false}"#,
                ),
                kv(
                    "/calico/ipam/v2/host/node2/ipv4/block/10.0.2.0-26",
                    r#"{"state":"pending","deleted":true}"#,
                ),
            ],
        };
        assert_eq!(datastore.decode(response), vec![ba("node1", "10.0.1.0/26")]);
    }

    #[test]
    fn test_new_requires_endpoints() {
        assert_matches!(
            EtcdBlockAffinityDatastore::new(EtcdDatastoreConfig::default()),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_changed_hosts() {
        let old = vec![ba("n1", "10.0.1.0/26"), ba("n2", "10.0.2.0/26")];
        let new = vec![
            ba("n1", "10.0.1.0/26"),
            ba("n2", "10.0.2.64/26"),
            ba("n3", "10.0.3.0/26"),
        ];
        let changed: Vec<_> = changed_hosts(&old, &new).into_iter().collect();
        assert_eq!(changed, vec!["n2".to_string(), "n3".to_string()]);
        assert!(changed_hosts(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn test_poll_reports_changes_and_syncs() {
        let datastore = Arc::new(FakeDatastore::default());
        *datastore.affinities.write() = vec![ba("n1", "10.0.1.0/26")];
        let (tx, mut rx) = mpsc::channel(8);
        let adapter = CalicoEtcdAdapter::new(datastore.clone(), Duration::from_millis(10), tx);

        assert!(!adapter.synced());
        assert_matches!(
            adapter.get_cidr_by_node_name("n1").await,
            Err(Error::AdapterNotStarted { .. })
        );

        let cancel = CancellationToken::new();
        adapter.start(cancel.clone()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("n1"));
        assert!(adapter.synced());
        assert_eq!(adapter.get_cidr_by_node_name("n1").await.unwrap(), vec!["10.0.1.0/26"]);

        datastore.affinities.write().push(ba("n2", "10.0.2.0/26"));
        assert_eq!(rx.recv().await.as_deref(), Some("n2"));
        cancel.cancel();
    }
}
