//! Ephemeral single-node k3s clusters in Docker for integration tests.
//!
//! [`Cluster`] drives the whole workflow; the modules underneath expose the
//! individual pieces (container lifecycle, image import, readiness waits).

pub mod cluster;
pub mod config;
pub mod docker;
pub mod error;
pub mod image;
pub mod logs;
pub mod marker;
pub mod readiness;
pub mod restart;
pub mod tasks;
pub mod wait;

pub use cluster::Cluster;
pub use error::{Error, Result};
