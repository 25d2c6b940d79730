//! Cluster configuration loaded from `.k3sbox.yaml`.
mod loader;
mod types;

pub use loader::{CONFIG_FILE, load, load_file};
pub use types::{ClusterConfig, ExistingPolicy, StateMount, Timeouts};
