use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// What `up` does when a cluster container already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExistingPolicy {
    Fail,
    Replace,
    Reuse,
}

/// A host directory bind-mounted into the cluster container with shared
/// propagation, so state created by nested containers is visible on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateMount {
    pub host: PathBuf,
    pub container: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub startup: u64,
    pub node: u64,
    pub pods: u64,
    pub exec: u64,
    pub pull: u64,
    pub copy: u64,
    pub poll_interval_ms: u64,
}

impl Timeouts {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup)
    }

    pub fn node(&self) -> Duration {
        Duration::from_secs(self.node)
    }

    pub fn pods(&self) -> Duration {
        Duration::from_secs(self.pods)
    }

    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull)
    }

    pub fn copy(&self) -> Duration {
        Duration::from_secs(self.copy)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: 300,
            node: 300,
            pods: 600,
            exec: 300,
            pull: 600,
            copy: 120,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Container name, also the value of the reserved cluster label.
    pub name: String,
    pub image: String,
    pub docker_binary: String,
    /// Host directory shared with the container for kubeconfig and manifests.
    pub workdir: PathBuf,
    pub cache_volume: String,
    /// Host directory for archives saved from the local Docker daemon.
    pub image_cache_dir: PathBuf,
    pub server_args: Vec<String>,
    pub host_network: bool,
    /// `host:container` port pairs, only used without host networking.
    pub ports: Vec<String>,
    pub state_mounts: Vec<StateMount>,
    pub engine_socket: PathBuf,
    /// Log line that signals the control plane finished booting.
    pub startup_marker: String,
    pub timeouts: Timeouts,
    pub always_pull: bool,
    pub on_existing: ExistingPolicy,
}

impl ClusterConfig {
    /// Directory inside the workdir holding manifests to apply.
    pub fn manifests_dir(&self) -> PathBuf {
        self.workdir.join("manifests")
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        self.workdir.join("kubeconfig.yaml")
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "k3sbox".to_string(),
            image: "rancher/k3s:v1.31.4-k3s1".to_string(),
            docker_binary: "docker".to_string(),
            workdir: PathBuf::from("target/k3sbox"),
            cache_volume: "k3sbox-cache".to_string(),
            image_cache_dir: PathBuf::from("target/k3sbox/images"),
            server_args: vec![
                "--disable=traefik".to_string(),
                "--disable=metrics-server".to_string(),
                "--write-kubeconfig-mode=644".to_string(),
            ],
            host_network: true,
            ports: Vec::new(),
            state_mounts: vec![StateMount {
                host: PathBuf::from("/var/lib/kubelet"),
                container: "/var/lib/kubelet".to_string(),
            }],
            engine_socket: PathBuf::from("/var/run/docker.sock"),
            startup_marker: "k3s is up and running".to_string(),
            timeouts: Timeouts::default(),
            always_pull: false,
            on_existing: ExistingPolicy::Reuse,
        }
    }
}
