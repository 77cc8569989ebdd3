//! Manager configuration file
//!
//! Optional YAML listing the member clusters whose pod CIDRs are discovered,
//! e.g.
//!
//! ```yaml
//! pskSeed: change-me
//! members:
//!   - name: member1
//!     kubeconfig: /etc/clusterlink/member1.kubeconfig
//!   - name: member2
//!     kubeconfig: /etc/clusterlink/member2.kubeconfig
//!     etcd:
//!       endpoints: ["http://10.0.0.10:2379"]
//! ```

use super::nodecidr::EtcdDatastoreConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One member cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberCluster {
    /// Name of the Cluster object
    pub name: String,
    /// Kubeconfig of the member; the in-cluster config when absent
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Calico etcd datastore of the member
    #[serde(default)]
    pub etcd: Option<EtcdDatastoreConfig>,
}

/// Contents of `--config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub psk_seed: Option<String>,
    #[serde(default)]
    pub members: Vec<MemberCluster>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
