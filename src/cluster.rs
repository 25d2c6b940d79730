//! Sequences container, readiness and image operations into the cluster
//! workflow: up, load images, apply, wait, restart, down.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, ExistingPolicy};
use crate::docker::{
    CONTAINER_KUBECONFIG, ClusterContainer, ContainerHandle, Engine, ExecResult, WORKDIR_MOUNT,
};
use crate::error::{Error, Result};
use crate::image::{ImageProvisioner, ImageRequests, ImportReport};
use crate::marker::Marker;
use crate::readiness::{ClusterApi, KubectlApi, ReadinessProbe};
use crate::restart::{RestartOutcome, Restarter};
use crate::wait::{AwaitSpec, await_true};

/// Marker written by `up` when it created the container, consumed by
/// `restart`.
pub const SKIP_RESTART_MARKER: &str = "skip-restart";

pub struct Cluster {
    container: Arc<ClusterContainer>,
    probe: ReadinessProbe,
    images: ImageProvisioner,
    skip_restart: Marker,
}

impl Cluster {
    pub fn new(engine: Arc<dyn Engine>, config: ClusterConfig) -> Self {
        let container = Arc::new(ClusterContainer::new(engine, config));
        let api: Arc<dyn ClusterApi> = Arc::new(KubectlApi::new(container.clone()));
        let config = container.config();
        Self {
            probe: ReadinessProbe::new(api).poll_interval(config.timeouts.poll_interval()),
            skip_restart: Marker::new(config.workdir.join(SKIP_RESTART_MARKER)),
            images: ImageProvisioner::new(container.clone()),
            container,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        self.container.config()
    }

    pub fn container(&self) -> &Arc<ClusterContainer> {
        &self.container
    }

    pub fn probe(&self) -> &ReadinessProbe {
        &self.probe
    }

    /// Bring the cluster to the point where workloads can be applied.
    pub fn up(&self) -> Result<ContainerHandle> {
        let config = self.config();

        let existing = match self.container.find()? {
            Some(existing) => match config.on_existing {
                ExistingPolicy::Fail => return Err(Error::ContainerExists(existing.name)),
                ExistingPolicy::Replace => {
                    info!(id = %existing.id, "replacing existing cluster container");
                    self.container.remove(&existing)?;
                    None
                }
                ExistingPolicy::Reuse => Some(existing),
            },
            None => None,
        };

        let fresh = existing.is_none();
        let (handle, since) = match existing {
            Some(handle) if handle.state.is_running() => {
                info!(id = %handle.id, "reusing running cluster container");
                // The startup line was logged before this process looked.
                (handle, UNIX_EPOCH)
            }
            Some(handle) => {
                info!(id = %handle.id, state = ?handle.state, "starting existing cluster container");
                let since = SystemTime::now();
                self.container.start(&handle)?;
                (handle, since)
            }
            None => {
                let handle = self.container.create(&self.container.create_spec())?;
                let since = SystemTime::now();
                self.container.start(&handle)?;
                (handle, since)
            }
        };

        self.container.wait_for_log(
            &handle,
            since,
            &config.startup_marker,
            config.timeouts.startup(),
        )?;
        self.fetch_kubeconfig(&handle)?;
        self.probe.wait_nodes(config.timeouts.node())?;
        self.probe.wait_service_account(config.timeouts.node())?;

        if fresh {
            self.skip_restart.mark()?;
        }
        info!(kubeconfig = %config.kubeconfig_path().display(), "cluster is up");
        Ok(handle)
    }

    /// Copy the in-container kubeconfig into the workdir, retrying until
    /// k3s has written it.
    fn fetch_kubeconfig(&self, handle: &ContainerHandle) -> Result<()> {
        let config = self.config();
        let target = config.kubeconfig_path();
        let timeout = config.timeouts.copy();
        let spec =
            AwaitSpec::new("kubeconfig", timeout).poll_interval(config.timeouts.poll_interval());
        await_true(spec, || {
            self.container
                .copy_from_container(handle, CONTAINER_KUBECONFIG, &target, timeout)
                .map(|_| true)
        })?;
        debug!(path = %target.display(), "kubeconfig written");
        Ok(())
    }

    pub fn load_images(&self, requests: &ImageRequests) -> Result<Vec<ImportReport>> {
        self.images.provision(requests)
    }

    /// Apply everything staged under the workdir's manifests directory.
    ///
    /// Returns `false` when nothing is staged.
    pub fn apply_manifests(&self) -> Result<bool> {
        let dir = self.config().manifests_dir();
        let staged = std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !staged {
            warn!(dir = %dir.display(), "no manifests staged, nothing to apply");
            return Ok(false);
        }

        let handle = self.container.require()?;
        let command = vec![
            "kubectl".to_string(),
            "apply".to_string(),
            "-R".to_string(),
            "-f".to_string(),
            format!("{WORKDIR_MOUNT}/manifests"),
        ];
        let result = self
            .container
            .exec(&handle, command, self.config().timeouts.exec())?;
        for line in &result.messages {
            info!("{line}");
        }
        Ok(true)
    }

    pub fn wait_pods(&self) -> Result<()> {
        self.probe.wait_workloads(self.config().timeouts.pods())
    }

    pub fn exec(&self, command: Vec<String>) -> Result<ExecResult> {
        let handle = self.container.require()?;
        self.container
            .exec(&handle, command, self.config().timeouts.exec())
    }

    pub fn restart(&self, specifiers: &[String]) -> Result<RestartOutcome> {
        Restarter::new(self.container.clone(), self.skip_restart.clone()).restart(specifiers)
    }

    /// Remove the container, the cache volume and the copied kubeconfig.
    pub fn down(&self) -> Result<()> {
        match self.container.find()? {
            Some(handle) => self.container.remove(&handle)?,
            None => info!(name = %self.config().name, "no cluster container to remove"),
        }
        self.container.remove_cache_volume()?;

        let kubeconfig = self.config().kubeconfig_path();
        match std::fs::remove_file(&kubeconfig) {
            Ok(()) => debug!(path = %kubeconfig.display(), "removed kubeconfig"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %kubeconfig.display(), error = %e, "failed to remove kubeconfig")
            }
        }
        Ok(())
    }
}
