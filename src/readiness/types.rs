//! Minimal views of the cluster objects readiness is derived from.
//!
//! Only the fields the readiness rules read are modelled; everything else in
//! the `kubectl -o json` output is ignored.

use std::fmt;

use serde::Deserialize;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_AVAILABLE: &str = "Available";
pub const STATUS_TRUE: &str = "True";
/// Termination reason of a container that ran to completion.
pub const REASON_COMPLETED: &str = "Completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Node,
    Pod,
    Deployment,
    StatefulSet,
    ServiceAccount,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Node => "node",
            SubjectKind::Pod => "pod",
            SubjectKind::Deployment => "deployment",
            SubjectKind::StatefulSet => "statefulset",
            SubjectKind::ServiceAccount => "service-account",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness of a single cluster object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCondition {
    pub kind: SubjectKind,
    /// `namespace/name` for namespaced objects, `name` otherwise.
    pub subject: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub name: String,
    pub namespace: Option<String>,
}

impl Metadata {
    pub fn subject(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

fn has_condition(conditions: &[Condition], kind: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.kind == kind && c.status == STATUS_TRUE)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    pub metadata: Metadata,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub conditions: Vec<Condition>,
}

impl Node {
    pub fn readiness(&self) -> ReadinessCondition {
        ReadinessCondition {
            kind: SubjectKind::Node,
            subject: self.metadata.subject(),
            ready: has_condition(&self.status.conditions, CONDITION_READY),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: Metadata,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodStatus {
    pub conditions: Vec<Condition>,
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub state: ContainerStateView,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerStateView {
    pub terminated: Option<Terminated>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Terminated {
    pub reason: Option<String>,
}

impl ContainerStatus {
    fn completed(&self) -> bool {
        self.state
            .terminated
            .as_ref()
            .is_some_and(|t| t.reason.as_deref() == Some(REASON_COMPLETED))
    }
}

impl Pod {
    /// Ready, or every container that is not ready ran to completion.
    ///
    /// A pod that reports no container statuses yet is not ready.
    pub fn is_ready(&self) -> bool {
        if has_condition(&self.status.conditions, CONDITION_READY) {
            return true;
        }
        let statuses = &self.status.container_statuses;
        !statuses.is_empty()
            && statuses
                .iter()
                .filter(|c| !c.ready)
                .all(ContainerStatus::completed)
    }

    pub fn readiness(&self) -> ReadinessCondition {
        ReadinessCondition {
            kind: SubjectKind::Pod,
            subject: self.metadata.subject(),
            ready: self.is_ready(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub metadata: Metadata,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeploymentStatus {
    pub conditions: Vec<Condition>,
}

impl Deployment {
    pub fn readiness(&self) -> ReadinessCondition {
        ReadinessCondition {
            kind: SubjectKind::Deployment,
            subject: self.metadata.subject(),
            ready: has_condition(&self.status.conditions, CONDITION_AVAILABLE),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatefulSet {
    pub metadata: Metadata,
    pub spec: StatefulSetSpec,
    pub status: StatefulSetStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatefulSetSpec {
    pub replicas: i32,
}

impl Default for StatefulSetSpec {
    fn default() -> Self {
        // Kubernetes defaults an unset replica count to one.
        Self { replicas: 1 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatefulSetStatus {
    pub available_replicas: i32,
}

impl StatefulSet {
    pub fn readiness(&self) -> ReadinessCondition {
        ReadinessCondition {
            kind: SubjectKind::StatefulSet,
            subject: self.metadata.subject(),
            ready: self.status.available_replicas == self.spec.replicas,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceAccount {
    pub metadata: Metadata,
}
