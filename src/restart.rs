//! Rollout restarts of workloads named as `kind[/namespace]/name`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::docker::ClusterContainer;
use crate::error::{Error, Result};
use crate::marker::Marker;
use crate::tasks::{self, Task};

const DEFAULT_NAMESPACE: &str = "default";
/// Extra exec budget on top of the rollout status timeout.
const STATUS_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Some(WorkloadKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Some(WorkloadKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }
}

/// A restartable workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpecifier {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceSpecifier {
    /// Parse `kind/name` or `kind/namespace/name`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidResourceSpecifier(s.to_string());
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid());
        }
        let (kind, namespace, name) = match parts.as_slice() {
            [kind, name] => (*kind, DEFAULT_NAMESPACE, *name),
            [kind, namespace, name] => (*kind, *namespace, *name),
            _ => return Err(invalid()),
        };
        Ok(Self {
            kind: WorkloadKind::parse(kind).ok_or_else(invalid)?,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// `kind/name` as understood by `kubectl`.
    pub fn target(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.name)
    }

    fn kubectl(&self, args: &[&str]) -> Vec<String> {
        let mut command: Vec<String> = ["kubectl", "rollout"]
            .iter()
            .chain(args)
            .map(|s| s.to_string())
            .collect();
        command.push(self.target());
        command.extend(["--namespace".to_string(), self.namespace.clone()]);
        command
    }
}

impl FromStr for ResourceSpecifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The skip marker was pending, nothing was restarted.
    Skipped,
    Restarted(usize),
}

/// Restarts workloads in parallel and waits for each rollout to finish.
pub struct Restarter {
    cluster: Arc<ClusterContainer>,
    skip: Marker,
    timeout: Duration,
}

impl Restarter {
    pub fn new(cluster: Arc<ClusterContainer>, skip: Marker) -> Self {
        let timeout = cluster.config().timeouts.pods();
        Self {
            cluster,
            skip,
            timeout,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Restart every workload named in `specifiers`.
    ///
    /// All specifiers are validated before anything runs. A pending skip
    /// marker is consumed and turns the call into a no-op.
    pub fn restart(&self, specifiers: &[String]) -> Result<RestartOutcome> {
        let resources = specifiers
            .iter()
            .map(|s| ResourceSpecifier::parse(s))
            .collect::<Result<Vec<_>>>()?;

        if self.skip.consume()? {
            info!("cluster was freshly started, skipping rollout restart");
            return Ok(RestartOutcome::Skipped);
        }
        if resources.is_empty() {
            return Ok(RestartOutcome::Restarted(0));
        }

        let handle = self.cluster.require()?;
        let total = resources.len();
        let work: Vec<Task> = resources
            .into_iter()
            .map(|resource| {
                let cluster = self.cluster.clone();
                let handle = handle.clone();
                let timeout = self.timeout;
                let exec_timeout = cluster.config().timeouts.exec();
                Task::new(resource.to_string(), move || {
                    cluster.exec_quiet(&handle, resource.kubectl(&["restart"]), exec_timeout)?;
                    let mut status = resource.kubectl(&["status"]);
                    status.push(format!("--timeout={}s", timeout.as_secs()));
                    cluster.exec_quiet(&handle, status, timeout + STATUS_GRACE)?;
                    info!(resource = %resource, "rolled out");
                    Ok(true)
                })
            })
            .collect();

        let failed = tasks::run_all(work)
            .iter()
            .filter(|report| !report.success)
            .count();
        if failed > 0 {
            return Err(Error::RestartFailed { failed, total });
        }
        Ok(RestartOutcome::Restarted(total))
    }
}
