//! Domain layer - Port definitions
//!
//! This module defines the traits (ports) that the Kubernetes and Calico
//! adapters implement, keeping reconcile logic testable without a cluster.

pub mod ports;

pub use ports::*;
