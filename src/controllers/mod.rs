//! Controllers
//!
//! - Worker: deduplicating async work queue shared by all controllers
//! - NodeCidr: pod CIDR discovery per member cluster
//! - NodeConfig: pipeline runs and NodeConfig publication
//! - Stores: reflector-backed listers and API writers

pub mod config;
pub mod nodecidr;
pub mod nodeconfig;
pub mod stores;
pub mod worker;

pub use config::{FileConfig, MemberCluster};
pub use nodecidr::{NodeCidrConfig, NodeCidrController};
pub use nodeconfig::{NodeConfigController, NodeConfigControllerConfig};
pub use worker::{Action, AsyncWorker, Reconciler};
