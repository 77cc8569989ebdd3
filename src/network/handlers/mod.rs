//! Handler Pipeline
//!
//! Ordered, stateless stages that turn a validated snapshot into one
//! [`NodeConfigSpec`] per node. Every stage reads the topology through the
//! [`Filter`] and appends primitives to the shared results map. A failing
//! stage aborts the run; callers must discard the partial results.

mod cni_support;
mod global_map;
mod host_network;
mod init_nodes;
mod mac_cache;
mod routes;
mod vx_network;

use crate::crd::{Device, NodeConfigSpec};
use crate::error::{Error, Result};
use crate::network::filter::Filter;
use std::collections::BTreeMap;
use tracing::{debug, error};

// =============================================================================
// Context
// =============================================================================

/// Computed config per ClusterNode name
pub type Results = BTreeMap<String, NodeConfigSpec>;

/// Shared state of one pipeline run
#[derive(Debug)]
pub struct Context {
    pub filter: Filter,
    pub results: Results,
    /// Seed of the pre-shared key carried by IPSec states
    pub psk_seed: String,
}

impl Context {
    pub fn new(filter: Filter, psk_seed: impl Into<String>) -> Self {
        Self {
            filter,
            results: BTreeMap::new(),
            psk_seed: psk_seed.into(),
        }
    }

    /// Device computed earlier in this run
    pub fn device_from_results(&self, node_name: &str, device_name: &str) -> Option<&Device> {
        device_from_results(&self.results, node_name, device_name)
    }
}

pub(crate) fn device_from_results<'a>(
    results: &'a Results,
    node_name: &str,
    device_name: &str,
) -> Option<&'a Device> {
    results.get(node_name).and_then(|c| c.device(device_name))
}

/// Config of a node, which [`Handler::InitNodes`] must have created
pub(crate) fn node_config<'a>(
    results: &'a mut Results,
    node_name: &str,
) -> Result<&'a mut NodeConfigSpec> {
    results
        .get_mut(node_name)
        .ok_or_else(|| Error::NodeConfigMissing {
            node: node_name.to_string(),
        })
}

// =============================================================================
// Handlers
// =============================================================================

/// One stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    InitNodes,
    VxLocalNetwork,
    VxBridgeNetwork,
    ServiceRoutes,
    PodRoutes,
    VxLocalMacCache,
    VxBridgeMacCache,
    HostNetwork,
    GlobalMap,
    CniSupport,
}

/// Stages in execution order. Route building needs the devices, the MAC
/// caches need both devices and MACs.
pub const PIPELINE: [Handler; 10] = [
    Handler::InitNodes,
    Handler::VxLocalNetwork,
    Handler::VxBridgeNetwork,
    Handler::ServiceRoutes,
    Handler::PodRoutes,
    Handler::VxLocalMacCache,
    Handler::VxBridgeMacCache,
    Handler::HostNetwork,
    Handler::GlobalMap,
    Handler::CniSupport,
];

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Handler::InitNodes => "InitNodes",
            Handler::VxLocalNetwork => "VxLocalNetwork",
            Handler::VxBridgeNetwork => "VxBridgeNetwork",
            Handler::ServiceRoutes => "ServiceRoutes",
            Handler::PodRoutes => "PodRoutes",
            Handler::VxLocalMacCache => "VxLocalMacCache",
            Handler::VxBridgeMacCache => "VxBridgeMacCache",
            Handler::HostNetwork => "HostNetwork",
            Handler::GlobalMap => "GlobalMap",
            Handler::CniSupport => "CNISupport",
        }
    }

    pub fn run(&self, ctx: &mut Context) -> Result<()> {
        match self {
            Handler::InitNodes => init_nodes::run(ctx),
            Handler::VxLocalNetwork => vx_network::run_local(ctx),
            Handler::VxBridgeNetwork => vx_network::run_bridge(ctx),
            Handler::ServiceRoutes => routes::run_service_routes(ctx),
            Handler::PodRoutes => routes::run_pod_routes(ctx),
            Handler::VxLocalMacCache => mac_cache::run_local(ctx),
            Handler::VxBridgeMacCache => mac_cache::run_bridge(ctx),
            Handler::HostNetwork => host_network::run(ctx),
            Handler::GlobalMap => global_map::run(ctx),
            Handler::CniSupport => cni_support::run(ctx),
        }
    }
}

impl std::fmt::Display for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Run every stage in order, stopping at the first error
pub fn run_pipeline(ctx: &mut Context) -> Result<()> {
    for handler in PIPELINE {
        debug!(handler = %handler, "Running network handler");
        if let Err(e) = handler.run(ctx) {
            error!(handler = %handler, error = %e, "Network handler failed");
            return Err(match e {
                Error::Handler { .. } => e,
                other => Error::handler(handler.name(), other.to_string()),
            });
        }
    }
    Ok(())
}
