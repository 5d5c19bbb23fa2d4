//! blobmap Common - Shared types and utilities
//!
//! This crate provides the configuration, error definitions, and event
//! vocabulary shared by the cluster map implementations and their callers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClusterMapConfig, Config, DatacenterConfig, FailureThresholds, LoggingConfig};
pub use error::{Error, Result};
pub use types::*;
