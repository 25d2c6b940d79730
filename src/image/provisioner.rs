use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::docker::{ClusterContainer, ContainerHandle};
use crate::error::{Error, Result};
use crate::tasks::{self, Task};

use super::reference::normalize;

/// containerd namespace the kubelet pulls from.
const CTR_NAMESPACE: &str = "k8s.io";
/// Directory inside the container that receives archives before import.
const IMPORT_DIR: &str = "/tmp";

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportSource {
    /// Pulled by the cluster itself from a remote registry.
    Registry(String),
    /// A tar archive on the host.
    Archive(PathBuf),
    /// An image in the host's Docker daemon.
    Daemon(String),
}

impl ImportSource {
    pub fn kind(&self) -> &'static str {
        match self {
            ImportSource::Registry(_) => "registry",
            ImportSource::Archive(_) => "archive",
            ImportSource::Daemon(_) => "daemon",
        }
    }
}

impl fmt::Display for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSource::Registry(image) | ImportSource::Daemon(image) => {
                write!(f, "{}:{image}", self.kind())
            }
            ImportSource::Archive(path) => write!(f, "archive:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported,
    SkippedAlreadyPresent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub source: ImportSource,
    pub outcome: ImportOutcome,
}

/// Images requested for one provisioning run.
#[derive(Debug, Clone, Default)]
pub struct ImageRequests {
    pub registry: Vec<String>,
    pub archives: Vec<PathBuf>,
    pub daemon: Vec<String>,
}

impl ImageRequests {
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty() && self.archives.is_empty() && self.daemon.is_empty()
    }

    /// One import per distinct canonical image or archive path.
    ///
    /// Duplicates would race each other inside the cluster's image store.
    pub fn plan(&self) -> Vec<ImportSource> {
        let sources: BTreeSet<ImportSource> = self
            .registry
            .iter()
            .map(|image| ImportSource::Registry(normalize(image)))
            .chain(self.archives.iter().cloned().map(ImportSource::Archive))
            .chain(
                self.daemon
                    .iter()
                    .map(|image| ImportSource::Daemon(normalize(image))),
            )
            .collect();
        sources.into_iter().collect()
    }
}

/// Imports images into the cluster's internal containerd store.
#[derive(Clone)]
pub struct ImageProvisioner {
    cluster: Arc<ClusterContainer>,
    cache_dir: PathBuf,
    pull_timeout: Duration,
    copy_timeout: Duration,
    exec_timeout: Duration,
    always_pull: bool,
}

impl ImageProvisioner {
    pub fn new(cluster: Arc<ClusterContainer>) -> Self {
        let config = cluster.config();
        Self {
            cache_dir: config.image_cache_dir.clone(),
            pull_timeout: config.timeouts.pull(),
            copy_timeout: config.timeouts.copy(),
            exec_timeout: config.timeouts.exec(),
            always_pull: config.always_pull,
            cluster,
        }
    }

    /// Pull daemon images even if the daemon already has them.
    pub fn always_pull(mut self, always: bool) -> Self {
        self.always_pull = always;
        self
    }

    /// Import every requested image in parallel.
    ///
    /// All imports run to completion; if any failed the run fails with
    /// [`Error::ProvisioningFailed`] after the others finished.
    pub fn provision(&self, requests: &ImageRequests) -> Result<Vec<ImportReport>> {
        let sources = requests.plan();
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let handle = self.cluster.require()?;
        info!(count = sources.len(), "importing images");

        let outcomes: Arc<Mutex<BTreeMap<usize, ImportOutcome>>> = Arc::default();
        let work: Vec<Task> = sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let this = self.clone();
                let handle = handle.clone();
                let source = source.clone();
                let outcomes = outcomes.clone();
                Task::new(source.to_string(), move || {
                    let outcome = this.import(&handle, &source)?;
                    if let Ok(mut map) = outcomes.lock() {
                        map.insert(index, outcome);
                    }
                    Ok(outcome != ImportOutcome::Failed)
                })
            })
            .collect();

        let results = tasks::run_all(work);
        let recorded = outcomes.lock().map(|m| m.clone()).unwrap_or_default();
        let reports: Vec<ImportReport> = sources
            .into_iter()
            .zip(results)
            .enumerate()
            .map(|(index, (source, result))| {
                let outcome = match recorded.get(&index) {
                    Some(outcome) if result.success => *outcome,
                    _ => ImportOutcome::Failed,
                };
                ImportReport { source, outcome }
            })
            .collect();

        let failed = reports
            .iter()
            .filter(|r| r.outcome == ImportOutcome::Failed)
            .count();
        if failed > 0 {
            return Err(Error::ProvisioningFailed {
                failed,
                total: reports.len(),
            });
        }
        Ok(reports)
    }

    fn import(&self, handle: &ContainerHandle, source: &ImportSource) -> Result<ImportOutcome> {
        match source {
            ImportSource::Registry(image) => self.import_from_registry(handle, image),
            ImportSource::Archive(path) => self.import_archive(handle, path),
            ImportSource::Daemon(image) => self.import_from_daemon(handle, image),
        }
    }

    /// Canonical references currently in the cluster's image store.
    pub fn cluster_images(&self, handle: &ContainerHandle) -> Result<BTreeSet<String>> {
        let result = self
            .cluster
            .exec_quiet(handle, ctr(&["image", "list", "-q"]), self.exec_timeout)?;
        Ok(result.messages.into_iter().collect())
    }

    /// Let the cluster pull `image` itself, unless it already has it.
    pub fn import_from_registry(
        &self,
        handle: &ContainerHandle,
        image: &str,
    ) -> Result<ImportOutcome> {
        let image = normalize(image);
        if self.cluster_images(handle)?.contains(&image) {
            debug!(%image, "already present in cluster");
            return Ok(ImportOutcome::SkippedAlreadyPresent);
        }
        self.cluster
            .exec_quiet(handle, ctr(&["image", "pull", &image]), self.pull_timeout)?;
        info!(%image, "pulled into cluster");
        Ok(ImportOutcome::Imported)
    }

    /// Copy a host tar archive into the container and import it.
    pub fn import_archive(&self, handle: &ContainerHandle, path: &Path) -> Result<ImportOutcome> {
        if !path.is_file() {
            return Err(Error::TransferFailed {
                source_path: path.display().to_string(),
                destination: handle.name.clone(),
                reason: "archive does not exist".to_string(),
            });
        }

        let target = format!(
            "{IMPORT_DIR}/k3sbox-{}.tar",
            stable_key(&path.display().to_string())
        );
        self.cluster
            .copy_to_container(handle, path, &target, self.copy_timeout)?;
        let imported = self
            .cluster
            .exec_quiet(handle, ctr(&["image", "import", &target]), self.exec_timeout);
        if let Err(e) = self.cluster.exec_quiet(
            handle,
            vec!["rm".into(), "-f".into(), target.clone()],
            self.exec_timeout,
        ) {
            warn!(%target, error = %e, "failed to clean up imported archive");
        }
        imported?;
        info!(archive = %path.display(), "imported into cluster");
        Ok(ImportOutcome::Imported)
    }

    /// Materialize `image` in the host daemon, save it to an archive and
    /// import that archive.
    pub fn import_from_daemon(
        &self,
        handle: &ContainerHandle,
        image: &str,
    ) -> Result<ImportOutcome> {
        let image = normalize(image);
        let engine = self.cluster.engine();

        if self.always_pull || !engine.image_present(&image)? {
            debug!(%image, "pulling into local daemon");
            engine.pull_image(&image, self.pull_timeout)?;
        }

        std::fs::create_dir_all(&self.cache_dir)?;
        let archive = self.cache_dir.join(format!("{}.tar", stable_key(&image)));
        engine.save_image(&image, &archive, self.pull_timeout)?;
        debug!(%image, archive = %archive.display(), "saved from local daemon");

        self.import_archive(handle, &archive)
    }
}

fn ctr(args: &[&str]) -> Vec<String> {
    ["ctr", "--namespace", CTR_NAMESPACE]
        .iter()
        .chain(args)
        .map(|s| s.to_string())
        .collect()
}

/// File-name-safe key derived from `value`; identical inputs share a key.
fn stable_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}
