//! Overlay network computation
//!
//! This module turns a snapshot of Clusters and ClusterNodes into per-node
//! network primitives:
//! - Filter: validation and read-only topology queries
//! - Handlers: the ordered computation pipeline
//! - Manager: runs the pipeline and keeps the last good output

pub mod constants;
pub mod filter;
pub mod handlers;
pub mod ip;
pub mod manager;

pub use filter::{exclude_invalid_items, Filter};
pub use handlers::{run_pipeline, Context, Handler, Results, PIPELINE};
pub use manager::{ManagerConfig, NetworkManager};
