use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::docker::ClusterContainer;
use crate::error::Result;
use crate::wait::{AwaitSpec, await_true};

use super::types::{
    Deployment, List, Node, Pod, ReadinessCondition, ServiceAccount, StatefulSet,
};

/// Read access to the cluster API.
pub trait ClusterApi: Send + Sync {
    fn nodes(&self) -> Result<Vec<Node>>;
    /// Pods in all namespaces.
    fn pods(&self) -> Result<Vec<Pod>>;
    fn deployments(&self) -> Result<Vec<Deployment>>;
    fn stateful_sets(&self) -> Result<Vec<StatefulSet>>;
    fn service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount>;
}

/// [`ClusterApi`] backed by `kubectl` running inside the cluster container.
pub struct KubectlApi {
    cluster: Arc<ClusterContainer>,
    timeout: Duration,
}

impl KubectlApi {
    pub fn new(cluster: Arc<ClusterContainer>) -> Self {
        let timeout = cluster.config().timeouts.exec();
        Self { cluster, timeout }
    }

    fn get<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let handle = self.cluster.require()?;
        let mut command = vec!["kubectl".to_string(), "get".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        command.extend(["-o".to_string(), "json".to_string()]);
        let result = self.cluster.exec_quiet(&handle, command, self.timeout)?;
        Ok(serde_json::from_str(&json_payload(&result.messages))?)
    }

    fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let list: List<T> = self.get(&[kind, "--all-namespaces"])?;
        Ok(list.items)
    }
}

/// The JSON document in captured `kubectl` output, skipping any warnings
/// printed ahead of it.
fn json_payload(messages: &[String]) -> String {
    let start = messages
        .iter()
        .position(|line| line.starts_with('{') || line.starts_with('['))
        .unwrap_or(messages.len());
    messages[start..].join("\n")
}

impl ClusterApi for KubectlApi {
    fn nodes(&self) -> Result<Vec<Node>> {
        let list: List<Node> = self.get(&["nodes"])?;
        Ok(list.items)
    }

    fn pods(&self) -> Result<Vec<Pod>> {
        self.list("pods")
    }

    fn deployments(&self) -> Result<Vec<Deployment>> {
        self.list("deployments")
    }

    fn stateful_sets(&self) -> Result<Vec<StatefulSet>> {
        self.list("statefulsets")
    }

    fn service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
        self.get(&["serviceaccount", name, "--namespace", namespace])
    }
}

/// Evaluates readiness rules against the cluster API.
#[derive(Clone)]
pub struct ReadinessProbe {
    api: Arc<dyn ClusterApi>,
    poll_interval: Duration,
}

impl ReadinessProbe {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Every node reports `Ready`. An empty node list is not ready.
    pub fn node_ready(&self) -> Result<bool> {
        let nodes = self.api.nodes()?;
        if nodes.is_empty() {
            debug!("no nodes registered yet");
            return Ok(false);
        }
        Ok(all_ready(nodes.iter().map(Node::readiness)))
    }

    pub fn pods_ready(&self) -> Result<bool> {
        Ok(all_ready(self.api.pods()?.iter().map(Pod::readiness)))
    }

    pub fn deployments_ready(&self) -> Result<bool> {
        Ok(all_ready(
            self.api.deployments()?.iter().map(Deployment::readiness),
        ))
    }

    pub fn statefulsets_ready(&self) -> Result<bool> {
        Ok(all_ready(
            self.api.stateful_sets()?.iter().map(StatefulSet::readiness),
        ))
    }

    /// The `default` service account can be read.
    ///
    /// The API server answers before the token controller has created it, so
    /// workloads applied too early fail admission.
    pub fn service_account_ready(&self) -> Result<bool> {
        match self.api.service_account("default", "default") {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(subject = "default/default", error = %e, "service-account not ready");
                Ok(false)
            }
        }
    }

    /// Pods, deployments and statefulsets are all ready.
    pub fn workloads_ready(&self) -> Result<bool> {
        // Evaluate every kind so each not-ready subject gets logged.
        let pods = self.pods_ready()?;
        let deployments = self.deployments_ready()?;
        let statefulsets = self.statefulsets_ready()?;
        Ok(pods && deployments && statefulsets)
    }

    pub fn wait_nodes(&self, timeout: Duration) -> Result<()> {
        self.wait("nodes ready", timeout, || self.node_ready())?;
        info!("node ready");
        Ok(())
    }

    pub fn wait_service_account(&self, timeout: Duration) -> Result<()> {
        self.wait("default service account", timeout, || {
            self.api.service_account("default", "default").map(|_| true)
        })?;
        info!("service account available");
        Ok(())
    }

    pub fn wait_workloads(&self, timeout: Duration) -> Result<()> {
        self.wait("workloads ready", timeout, || self.workloads_ready())?;
        info!("all workloads ready");
        Ok(())
    }

    /// Poll `check`, keeping quiet about failed queries unless the wait
    /// gives up; then the most recent failure is logged at warn level.
    fn wait(
        &self,
        description: &str,
        timeout: Duration,
        mut check: impl FnMut() -> Result<bool>,
    ) -> Result<()> {
        let last_failure: Arc<Mutex<Vec<String>>> = Arc::default();
        let replay = last_failure.clone();
        let spec = AwaitSpec::new(description, timeout)
            .poll_interval(self.poll_interval)
            .on_timeout(move || {
                let lines = replay.lock().map(|l| l.clone()).unwrap_or_default();
                for line in lines {
                    warn!("{line}");
                }
            });
        await_true(spec, || {
            let result = check();
            if let Ok(mut slot) = last_failure.lock() {
                *slot = match &result {
                    Ok(_) => Vec::new(),
                    Err(e) => std::iter::once(e.to_string())
                        .chain(e.output().iter().cloned())
                        .collect(),
                };
            }
            result
        })
    }
}

fn all_ready(conditions: impl Iterator<Item = ReadinessCondition>) -> bool {
    let mut ready = true;
    for condition in conditions.filter(|c| !c.ready) {
        debug!(kind = %condition.kind, subject = %condition.subject, "not ready");
        ready = false;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::docker::fake::FakeEngine;
    use crate::error::Error;
    use crate::logs::count_warnings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned API answers; node readiness flips after `nodes_ready_after` calls.
    #[derive(Default)]
    struct CannedApi {
        nodes: Vec<Node>,
        pods: Vec<Pod>,
        deployments: Vec<Deployment>,
        stateful_sets: Vec<StatefulSet>,
        service_account: bool,
        nodes_ready_after: usize,
        node_calls: AtomicUsize,
        failures: Mutex<usize>,
    }

    fn json<T: DeserializeOwned>(s: &str) -> T {
        serde_json::from_str(s).unwrap()
    }

    fn ready_node() -> Node {
        json(r#"{"metadata": {"name": "n1"}, "status": {"conditions": [{"type": "Ready", "status": "True"}]}}"#)
    }

    impl ClusterApi for CannedApi {
        fn nodes(&self) -> Result<Vec<Node>> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::CommandFailed {
                        command: "kubectl get nodes".into(),
                        exit_code: Some(1),
                        output: vec!["connection refused".into()],
                    });
                }
            }
            let calls = self.node_calls.fetch_add(1, Ordering::SeqCst);
            if calls < self.nodes_ready_after {
                return Ok(Vec::new());
            }
            Ok(self.nodes.clone())
        }

        fn pods(&self) -> Result<Vec<Pod>> {
            Ok(self.pods.clone())
        }

        fn deployments(&self) -> Result<Vec<Deployment>> {
            Ok(self.deployments.clone())
        }

        fn stateful_sets(&self) -> Result<Vec<StatefulSet>> {
            Ok(self.stateful_sets.clone())
        }

        fn service_account(&self, namespace: &str, name: &str) -> Result<ServiceAccount> {
            if self.service_account {
                Ok(ServiceAccount::default())
            } else {
                Err(Error::CommandFailed {
                    command: format!("kubectl get serviceaccount {name} -n {namespace}"),
                    exit_code: Some(1),
                    output: vec!["NotFound".into()],
                })
            }
        }
    }

    fn probe(api: CannedApi) -> ReadinessProbe {
        ReadinessProbe::new(Arc::new(api)).poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn no_nodes_is_not_ready() {
        assert!(!probe(CannedApi::default()).node_ready().unwrap());
    }

    #[test]
    fn wait_nodes_retries_errors_until_ready() {
        let api = CannedApi {
            nodes: vec![ready_node()],
            nodes_ready_after: 2,
            failures: Mutex::new(2),
            ..CannedApi::default()
        };
        probe(api).wait_nodes(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn wait_nodes_times_out() {
        let err = probe(CannedApi::default())
            .wait_nodes(Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn service_account_errors_mean_not_ready() {
        assert!(!probe(CannedApi::default()).service_account_ready().unwrap());
        let api = CannedApi {
            service_account: true,
            ..CannedApi::default()
        };
        assert!(probe(api).service_account_ready().unwrap());
    }

    #[test]
    fn workloads_need_every_kind_ready() {
        let api = CannedApi {
            pods: vec![json(
                r#"{"metadata": {"name": "job"}, "status": {
                    "conditions": [{"type": "Ready", "status": "False"}],
                    "containerStatuses": [{"name": "c", "ready": false,
                        "state": {"terminated": {"reason": "Completed"}}}]
                }}"#,
            )],
            deployments: vec![json(
                r#"{"metadata": {"name": "api"}, "status": {"conditions": [{"type": "Available", "status": "True"}]}}"#,
            )],
            stateful_sets: vec![json(
                r#"{"metadata": {"name": "db"}, "spec": {"replicas": 2}, "status": {"availableReplicas": 1}}"#,
            )],
            ..CannedApi::default()
        };
        let probe = probe(api);
        assert!(probe.pods_ready().unwrap());
        assert!(probe.deployments_ready().unwrap());
        assert!(!probe.statefulsets_ready().unwrap());
        assert!(!probe.workloads_ready().unwrap());
    }

    #[test]
    fn empty_cluster_has_ready_workloads() {
        assert!(probe(CannedApi::default()).workloads_ready().unwrap());
    }

    #[test]
    fn json_payload_skips_leading_warnings() {
        let messages = vec![
            "Warning: v1 ComponentStatus is deprecated".to_string(),
            "{".to_string(),
            "\"items\": []".to_string(),
            "}".to_string(),
        ];
        let list: List<Pod> = serde_json::from_str(&json_payload(&messages)).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn kubectl_api_parses_exec_output() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let config = ClusterConfig {
            workdir: dir.path().join("work"),
            ..ClusterConfig::default()
        };
        let cluster = Arc::new(ClusterContainer::new(engine.clone(), config));
        cluster.create(&cluster.create_spec()).unwrap();
        engine.script(
            "kubectl get nodes -o json",
            0,
            &[
                "{",
                "\"items\": [{\"metadata\": {\"name\": \"n1\"},",
                "\"status\": {\"conditions\": [{\"type\": \"Ready\", \"status\": \"True\"}]}}]",
                "}",
            ],
        );
        engine.script("kubectl get serviceaccount", 1, &["Error from server (NotFound)"]);

        let probe = ReadinessProbe::new(Arc::new(KubectlApi::new(cluster)));
        assert!(probe.node_ready().unwrap());
        assert!(!probe.service_account_ready().unwrap());
        assert_eq!(
            engine.exec_commands().last().unwrap(),
            "kubectl get serviceaccount default --namespace default -o json"
        );
    }

    #[test]
    fn failed_polls_stay_quiet_until_the_wait_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let config = ClusterConfig {
            workdir: dir.path().join("work"),
            ..ClusterConfig::default()
        };
        let cluster = Arc::new(ClusterContainer::new(engine.clone(), config));
        cluster.create(&cluster.create_spec()).unwrap();
        engine.script("kubectl get serviceaccount", 1, &["Error from server (NotFound)"]);

        let probe = ReadinessProbe::new(Arc::new(KubectlApi::new(cluster)))
            .poll_interval(Duration::from_millis(10));
        let (result, warnings) =
            count_warnings(|| probe.wait_service_account(Duration::from_millis(300)));

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(engine.exec_commands().len() > 3);
        // The final failure and its one output line.
        assert_eq!(warnings, 2);
    }
}
