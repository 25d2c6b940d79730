use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{Level, debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::logs::LogAggregator;
use crate::wait::{AwaitSpec, await_true};

use super::engine::Engine;
use super::types::{
    CancelToken, ContainerHandle, CreateSpec, ExecResult, ExecSpec, Mount, Propagation,
};

/// Label carried by the cluster container and its cache volume.
pub const CLUSTER_LABEL: &str = "io.k3sbox.cluster";
/// Where the host workdir appears inside the container.
pub const WORKDIR_MOUNT: &str = "/k3s";
/// Kubeconfig written by k3s inside the container.
pub const CONTAINER_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
const CACHE_MOUNT: &str = "/var/lib/rancher/k3s/agent/containerd";
const EXEC_POLL: Duration = Duration::from_millis(20);

/// Follows the container's logs until dropped.
#[derive(Debug)]
pub struct LogFollow {
    pub output: LogAggregator,
    cancel: CancelToken,
}

impl Drop for LogFollow {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Creates, discovers, drives and tears down the single cluster container.
///
/// The container id is recorded at creation time; label discovery is only
/// used when no id is held (for example in a fresh process).
pub struct ClusterContainer {
    engine: Arc<dyn Engine>,
    config: ClusterConfig,
    id: Mutex<Option<String>>,
}

impl ClusterContainer {
    pub fn new(engine: Arc<dyn Engine>, config: ClusterConfig) -> Self {
        Self {
            engine,
            config,
            id: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(CLUSTER_LABEL.to_string(), self.config.name.clone())])
    }

    fn remembered(&self) -> Option<String> {
        self.id.lock().ok().and_then(|id| id.clone())
    }

    fn remember(&self, id: Option<String>) {
        if let Ok(mut slot) = self.id.lock() {
            *slot = id;
        }
    }

    /// Locate the cluster container, if one exists.
    pub fn find(&self) -> Result<Option<ContainerHandle>> {
        if let Some(id) = self.remembered() {
            match self.engine.inspect_state(&id)? {
                Some(state) => {
                    return Ok(Some(ContainerHandle {
                        id,
                        name: self.config.name.clone(),
                        labels: self.labels(),
                        state,
                    }));
                }
                None => {
                    debug!(%id, "recorded container is gone, falling back to discovery");
                    self.remember(None);
                }
            }
        }

        let label = format!("{CLUSTER_LABEL}={}", self.config.name);
        let mut matches = self.engine.list_containers(&label, &self.config.name)?;
        if matches.len() > 1 {
            warn!(
                count = matches.len(),
                label = %label,
                "multiple cluster containers found, using the oldest"
            );
        }
        matches.sort_by(|a, b| a.created.cmp(&b.created));
        let handle = matches.into_iter().next().map(ContainerHandle::from);
        if let Some(handle) = &handle {
            self.remember(Some(handle.id.clone()));
        }
        Ok(handle)
    }

    /// Like [`find`](Self::find), but a missing container is an error.
    pub fn require(&self) -> Result<ContainerHandle> {
        self.find()?
            .ok_or_else(|| Error::ContainerNotFound(self.config.name.clone()))
    }

    /// Creation parameters derived from the configuration.
    pub fn create_spec(&self) -> CreateSpec {
        let mut mounts = vec![
            Mount::Bind {
                host: absolute(&self.config.workdir),
                container: WORKDIR_MOUNT.to_string(),
                propagation: Propagation::Private,
            },
            Mount::Volume {
                name: self.config.cache_volume.clone(),
                container: CACHE_MOUNT.to_string(),
            },
            Mount::Bind {
                host: self.config.engine_socket.clone(),
                container: self.config.engine_socket.display().to_string(),
                propagation: Propagation::Private,
            },
        ];
        mounts.extend(self.config.state_mounts.iter().map(|m| Mount::Bind {
            host: m.host.clone(),
            container: m.container.clone(),
            propagation: Propagation::Rshared,
        }));

        let mut command = vec!["server".to_string()];
        command.extend(self.config.server_args.iter().cloned());

        CreateSpec {
            name: self.config.name.clone(),
            image: self.config.image.clone(),
            labels: self.labels(),
            mounts,
            ports: self.config.ports.clone(),
            command,
            privileged: true,
            host_pid: true,
            host_network: self.config.host_network,
        }
    }

    /// Create the cache volume (if needed) and the container.
    pub fn create(&self, spec: &CreateSpec) -> Result<ContainerHandle> {
        std::fs::create_dir_all(&self.config.workdir)?;
        if !self.engine.volume_exists(&self.config.cache_volume)? {
            self.engine
                .create_volume(&self.config.cache_volume, &self.labels())?;
            debug!(volume = %self.config.cache_volume, "created cache volume");
        }

        let id = self.engine.create_container(spec)?;
        info!(name = %spec.name, id = %short(&id), image = %spec.image, "created cluster container");
        self.remember(Some(id.clone()));
        let state = self
            .engine
            .inspect_state(&id)?
            .ok_or_else(|| Error::ContainerNotFound(id.clone()))?;
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            state,
        })
    }

    pub fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.engine.start_container(&handle.id)?;
        info!(id = %short(&handle.id), "started cluster container");
        Ok(())
    }

    /// Stop the container. No-op unless it is running.
    pub fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        match self.engine.inspect_state(&handle.id)? {
            Some(state) if state.is_running() => {
                self.engine.stop_container(&handle.id)?;
                info!(id = %short(&handle.id), "stopped cluster container");
            }
            _ => debug!(id = %short(&handle.id), "container not running, nothing to stop"),
        }
        Ok(())
    }

    /// Stop, then force-remove the container including anonymous volumes.
    pub fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.stop(handle)?;
        self.engine.remove_container(&handle.id)?;
        self.remember(None);
        info!(id = %short(&handle.id), "removed cluster container");
        Ok(())
    }

    /// Remove the cache volume if present.
    pub fn remove_cache_volume(&self) -> Result<()> {
        if self.engine.volume_exists(&self.config.cache_volume)? {
            self.engine.remove_volume(&self.config.cache_volume)?;
            info!(volume = %self.config.cache_volume, "removed cache volume");
        }
        Ok(())
    }

    pub fn cache_volume_exists(&self) -> Result<bool> {
        self.engine.volume_exists(&self.config.cache_volume)
    }

    /// Follow combined stdout/stderr from `since` until the returned value
    /// is dropped.
    pub fn stream_logs(&self, handle: &ContainerHandle, since: SystemTime) -> Result<LogFollow> {
        let output = LogAggregator::new(handle.name.clone());
        let cancel = CancelToken::new();
        self.engine
            .follow_logs(&handle.id, since, output.clone(), cancel.clone())?;
        Ok(LogFollow { output, cancel })
    }

    /// Block until a log line since `since` contains `marker`.
    ///
    /// On timeout the captured logs are replayed at warn level.
    pub fn wait_for_log(
        &self,
        handle: &ContainerHandle,
        since: SystemTime,
        marker: &str,
        timeout: Duration,
    ) -> Result<()> {
        let follow = self.stream_logs(handle, since)?;
        let output = follow.output.clone();
        let replay = follow.output.clone();
        let spec = AwaitSpec::new(format!("log line '{marker}'"), timeout)
            .poll_interval(self.config.timeouts.poll_interval())
            .on_timeout(move || replay.replay(Level::WARN));
        await_true(spec, || Ok(output.contains(marker)))?;
        info!(marker, "cluster reported startup");
        Ok(())
    }

    /// Run `command` inside the container with the in-container kubeconfig
    /// exported and the workdir mount as working directory.
    ///
    /// A failed or timed-out command has its output replayed at warn level.
    pub fn exec(
        &self,
        handle: &ContainerHandle,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult> {
        self.run_exec(handle, command, timeout, Some(Level::WARN))
    }

    /// Like [`exec`](Self::exec), but never replays output. For commands
    /// that are retried or whose caller reports the failure itself.
    pub fn exec_quiet(
        &self,
        handle: &ContainerHandle,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecResult> {
        self.run_exec(handle, command, timeout, None)
    }

    fn run_exec(
        &self,
        handle: &ContainerHandle,
        command: Vec<String>,
        timeout: Duration,
        replay: Option<Level>,
    ) -> Result<ExecResult> {
        let spec = ExecSpec {
            command,
            workdir: Some(WORKDIR_MOUNT.to_string()),
            env: vec![("KUBECONFIG".to_string(), CONTAINER_KUBECONFIG.to_string())],
        };
        let shown = spec.display();
        debug!(command = %shown, "exec");

        let output = LogAggregator::new(shown.clone());
        let session = self.engine.exec(&handle.id, &spec, output.clone())?;

        if !output.is_completed() {
            let done = output.clone();
            let mut wait = AwaitSpec::new(format!("`{shown}`"), timeout).poll_interval(EXEC_POLL);
            if let Some(level) = replay {
                let replay = output.clone();
                wait = wait.on_timeout(move || replay.replay(level));
            }
            if let Err(e) = await_true(wait, || Ok(done.is_completed())) {
                // Abandons the client; the engine-side process may keep running.
                session.cancel.cancel();
                return Err(e);
            }
        }

        let messages = output.messages();
        match session.exit.get() {
            Some(0) => Ok(ExecResult {
                exit_code: 0,
                messages,
            }),
            exit_code => {
                if let Some(level) = replay {
                    output.replay(level);
                }
                Err(Error::CommandFailed {
                    command: shown,
                    exit_code,
                    output: messages,
                })
            }
        }
    }

    /// Copy a host file or directory into the container.
    pub fn copy_to_container(
        &self,
        handle: &ContainerHandle,
        host: &Path,
        container: &str,
        timeout: Duration,
    ) -> Result<()> {
        if !host.exists() {
            return Err(Error::TransferFailed {
                source_path: host.display().to_string(),
                destination: container.to_string(),
                reason: "source does not exist".to_string(),
            });
        }
        self.engine
            .copy_to_container(&handle.id, host, container, timeout)
    }

    /// Copy a file or directory out of the container onto the host.
    pub fn copy_from_container(
        &self,
        handle: &ContainerHandle,
        container: &str,
        host: &Path,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(parent) = host.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::TransferFailed {
                source_path: container.to_string(),
                destination: host.display().to_string(),
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        self.engine
            .copy_from_container(&handle.id, container, host, timeout)
    }
}

fn absolute(path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}
