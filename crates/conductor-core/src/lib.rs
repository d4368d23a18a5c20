//! Conductor Core: error type, configuration, JSON merge helpers.

pub mod config;
pub mod error;
pub mod merge;

pub use config::{ClusterSettings, ConductorConfig, DataPaths};
pub use error::{Error, Result};
pub use merge::deep_merge;
