// Docker access: the engine client and the cluster container built on it.

pub mod engine;
pub mod lifecycle;
mod run;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use engine::{DockerCli, Engine, ensure_available};
pub use lifecycle::{
    CLUSTER_LABEL, CONTAINER_KUBECONFIG, ClusterContainer, LogFollow, WORKDIR_MOUNT,
};
pub use types::{
    CancelToken, ContainerHandle, ContainerState, ContainerSummary, CreateSpec, ExecResult,
    ExecSession, ExecSpec, ExitCell, Mount, Propagation,
};
