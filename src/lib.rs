//! Kiln - daemonless, layer-cached container image builder
//!
//! Builds OCI images for Python, Node and PHP applications as an ordered
//! stack of deterministic layers, caching the expensive dependency layers
//! in a registry keyed by the base image and the dependency descriptors.

pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod family;
pub mod image;
pub mod layer;
pub mod orchestrator;
pub mod registry;
pub mod ui;

pub use error::{KilnError, KilnResult};
