//! API Module
//!
//! REST diagnostics of the computed network configs.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
