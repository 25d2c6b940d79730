//! In-memory [`Engine`] for tests.
//!
//! Simulates just enough of Docker and of the cluster's `ctr` image store to
//! drive lifecycle, exec and provisioning code without a daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::logs::{Chunk, LogAggregator};

use super::engine::Engine;
use super::lifecycle::CLUSTER_LABEL;
use super::types::{
    CancelToken, ContainerState, ContainerSummary, CreateSpec, ExecSession, ExecSpec, ExitCell,
};

struct FakeContainer {
    name: String,
    created: String,
    state: ContainerState,
    files: BTreeMap<String, Vec<u8>>,
}

struct Script {
    prefix: String,
    exit: i32,
    lines: Vec<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    volumes: Mutex<BTreeSet<String>>,
    logs: Mutex<Vec<String>>,
    scripts: Mutex<Vec<Script>>,
    hanging: Mutex<BTreeSet<String>>,
    execs: Mutex<Vec<(ExecSpec, CancelToken)>>,
    /// Images the cluster's `ctr` can pull from a registry.
    registry: Mutex<BTreeSet<String>>,
    /// Images in the cluster's internal store.
    cluster_images: Mutex<BTreeSet<String>>,
    /// Images in the host daemon.
    daemon_images: Mutex<BTreeSet<String>>,
    /// Images the host daemon can pull.
    daemon_registry: Mutex<BTreeSet<String>>,
    daemon_pulls: AtomicUsize,
    /// Files every new container starts with.
    seeded: Mutex<BTreeMap<String, Vec<u8>>>,
    stops: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeEngine {
    pub fn add_container(&self, id: &str, name: &str, created: &str) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                created: created.to_string(),
                state: ContainerState::Running,
                files: BTreeMap::new(),
            },
        );
    }

    pub fn forget_container(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Commands starting with `prefix` print `lines` and exit with `exit`.
    pub fn script(&self, prefix: &str, exit: i32, lines: &[&str]) {
        self.scripts.lock().unwrap().push(Script {
            prefix: prefix.to_string(),
            exit,
            lines: lines.iter().map(|l| l.to_string()).collect(),
        });
    }

    /// Commands whose program is `program` never finish.
    pub fn hang(&self, program: &str) {
        self.hanging.lock().unwrap().insert(program.to_string());
    }

    pub fn set_logs(&self, lines: &[&str]) {
        *self.logs.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn last_exec(&self) -> Option<ExecSpec> {
        self.execs.lock().unwrap().last().map(|(spec, _)| spec.clone())
    }

    pub fn exec_commands(&self) -> Vec<String> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.display())
            .collect()
    }

    /// Argument vectors of every exec, as passed to the engine.
    pub fn exec_argv(&self) -> Vec<Vec<String>> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.command.clone())
            .collect()
    }

    pub fn last_exec_cancelled(&self) -> bool {
        self.execs
            .lock()
            .unwrap()
            .last()
            .is_some_and(|(_, cancel)| cancel.is_cancelled())
    }

    pub fn add_registry_image(&self, image: &str) {
        self.registry.lock().unwrap().insert(image.to_string());
    }

    pub fn add_cluster_image(&self, image: &str) {
        self.cluster_images.lock().unwrap().insert(image.to_string());
    }

    pub fn cluster_images(&self) -> BTreeSet<String> {
        self.cluster_images.lock().unwrap().clone()
    }

    pub fn add_daemon_image(&self, image: &str) {
        self.daemon_images.lock().unwrap().insert(image.to_string());
    }

    pub fn add_daemon_registry_image(&self, image: &str) {
        self.daemon_registry.lock().unwrap().insert(image.to_string());
    }

    pub fn daemon_pulls(&self) -> usize {
        self.daemon_pulls.load(Ordering::SeqCst)
    }

    pub fn seed_file(&self, path: &str, bytes: &[u8]) {
        self.seeded
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(f(container))
    }

    /// Simulated `ctr` image commands. `None` if `command` is not one.
    fn ctr(&self, id: &str, command: &[String]) -> Option<(i32, Vec<String>)> {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["ctr", "--namespace", "k8s.io", "image", "list", "-q"] => {
                Some((0, self.cluster_images().into_iter().collect()))
            }
            ["ctr", "--namespace", "k8s.io", "image", "pull", reference] => {
                if self.registry.lock().unwrap().contains(*reference) {
                    self.add_cluster_image(reference);
                    Some((0, vec![format!("{reference}: resolved")]))
                } else {
                    Some((1, vec![format!("ctr: {reference}: not found")]))
                }
            }
            ["ctr", "--namespace", "k8s.io", "image", "import", path] => {
                let content = self
                    .with_container(id, |c| c.files.get(*path).cloned())
                    .ok()
                    .flatten();
                match content {
                    Some(bytes) => {
                        let names = String::from_utf8_lossy(&bytes).into_owned();
                        for name in names.lines().filter(|l| !l.trim().is_empty()) {
                            self.add_cluster_image(name.trim());
                        }
                        Some((0, vec![format!("unpacking {path}...done")]))
                    }
                    None => Some((1, vec![format!("ctr: open {path}: no such file")])),
                }
            }
            _ => None,
        }
    }
}

impl Engine for FakeEngine {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn list_containers(&self, label: &str, name: &str) -> Result<Vec<ContainerSummary>> {
        let expected = format!("{CLUSTER_LABEL}={name}");
        if label != expected {
            return Ok(Vec::new());
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.name.clone(),
                labels: BTreeMap::from([(CLUSTER_LABEL.to_string(), name.to_string())]),
                state: c.state,
                created: c.created.clone(),
            })
            .collect())
    }

    fn inspect_state(&self, id: &str) -> Result<Option<ContainerState>> {
        Ok(self.containers.lock().unwrap().get(id).map(|c| c.state))
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:064x}", n + 1);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                created: format!("2030-01-01 00:00:{n:02} +0000 UTC"),
                state: ContainerState::Created,
                files: self.seeded.lock().unwrap().clone(),
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.with_container(id, |c| c.state = ContainerState::Running)
    }

    fn stop_container(&self, id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.with_container(id, |c| c.state = ContainerState::Exited)
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    fn create_volume(&self, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.volumes.lock().unwrap().contains(name))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    fn follow_logs(
        &self,
        id: &str,
        _since: SystemTime,
        sink: LogAggregator,
        _cancel: CancelToken,
    ) -> Result<()> {
        self.with_container(id, |_| ())?;
        for line in self.logs.lock().unwrap().iter() {
            // Split each line to exercise reassembly.
            let (head, tail) = line.split_at(line.len() / 2);
            sink.accept(Chunk::stdout(head));
            sink.accept(Chunk::stderr(format!("{tail}\n")));
        }
        Ok(())
    }

    fn exec(&self, id: &str, spec: &ExecSpec, sink: LogAggregator) -> Result<ExecSession> {
        self.with_container(id, |_| ())?;
        let cancel = CancelToken::new();
        let exit = ExitCell::default();
        self.execs
            .lock()
            .unwrap()
            .push((spec.clone(), cancel.clone()));

        let program = spec.command.first().cloned().unwrap_or_default();
        if self.hanging.lock().unwrap().contains(&program) {
            return Ok(ExecSession { exit, cancel });
        }

        let display = spec.display();
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| display.starts_with(&s.prefix))
            .map(|s| (s.exit, s.lines.clone()));
        let (code, lines) = scripted
            .or_else(|| self.ctr(id, &spec.command))
            .unwrap_or((0, Vec::new()));

        for line in lines {
            sink.accept(Chunk::stdout(format!("{line}\n")));
        }
        exit.set(Some(code));
        sink.complete();
        Ok(ExecSession { exit, cancel })
    }

    fn copy_to_container(
        &self,
        id: &str,
        host: &Path,
        container: &str,
        _timeout: Duration,
    ) -> Result<()> {
        let bytes = std::fs::read(host).map_err(|e| Error::TransferFailed {
            source_path: host.display().to_string(),
            destination: container.to_string(),
            reason: e.to_string(),
        })?;
        self.with_container(id, |c| {
            c.files.insert(container.to_string(), bytes);
        })
    }

    fn copy_from_container(
        &self,
        id: &str,
        container: &str,
        host: &Path,
        _timeout: Duration,
    ) -> Result<()> {
        let bytes = self
            .with_container(id, |c| c.files.get(container).cloned())?
            .ok_or_else(|| Error::TransferFailed {
                source_path: container.to_string(),
                destination: host.display().to_string(),
                reason: "no such file in container".to_string(),
            })?;
        std::fs::write(host, bytes)?;
        Ok(())
    }

    fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.daemon_images.lock().unwrap().contains(image))
    }

    fn pull_image(&self, image: &str, _timeout: Duration) -> Result<()> {
        self.daemon_pulls.fetch_add(1, Ordering::SeqCst);
        if self.daemon_registry.lock().unwrap().contains(image) {
            self.add_daemon_image(image);
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: format!("docker pull {image}"),
                exit_code: Some(1),
                output: vec![format!("manifest for {image} not found")],
            })
        }
    }

    fn save_image(&self, image: &str, dest: &Path, _timeout: Duration) -> Result<()> {
        if !self.daemon_images.lock().unwrap().contains(image) {
            return Err(Error::CommandFailed {
                command: format!("docker save {image}"),
                exit_code: Some(1),
                output: vec![format!("No such image: {image}")],
            });
        }
        std::fs::write(dest, format!("{image}\n"))?;
        Ok(())
    }
}
