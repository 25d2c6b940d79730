//! Cluster readiness: nodes, workloads and the default service account.
mod probe;
mod types;

pub use probe::{ClusterApi, KubectlApi, ReadinessProbe};
pub use types::{
    Deployment, List, Node, Pod, ReadinessCondition, ServiceAccount, StatefulSet, SubjectKind,
};
