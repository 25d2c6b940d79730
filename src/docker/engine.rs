use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::logs::LogAggregator;

use super::run::{self, Captured};
use super::types::{
    CancelToken, ContainerState, ContainerSummary, CreateSpec, ExecSession, ExecSpec, Mount,
    Propagation,
};

/// Timeout for quick metadata calls (`ps`, `inspect`, `volume ls`).
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for lifecycle calls; `stop` waits for the container's grace period.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(120);

/// The subset of the container engine the cluster needs.
pub trait Engine: Send + Sync {
    /// Verify the daemon is reachable.
    fn ping(&self) -> Result<()>;

    /// All containers, running or not, carrying `label` and named `name`.
    fn list_containers(&self, label: &str, name: &str) -> Result<Vec<ContainerSummary>>;

    /// Current state, or `None` if no such container exists.
    fn inspect_state(&self, id: &str) -> Result<Option<ContainerState>>;

    /// Create a container and return its id.
    fn create_container(&self, spec: &CreateSpec) -> Result<String>;

    fn start_container(&self, id: &str) -> Result<()>;

    fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container together with its anonymous volumes.
    fn remove_container(&self, id: &str) -> Result<()>;

    fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    fn volume_exists(&self, name: &str) -> Result<bool>;

    fn remove_volume(&self, name: &str) -> Result<()>;

    /// Follow combined stdout/stderr from `since` into `sink` until cancelled.
    fn follow_logs(
        &self,
        id: &str,
        since: SystemTime,
        sink: LogAggregator,
        cancel: CancelToken,
    ) -> Result<()>;

    /// Start `spec` inside the container, streaming its output into `sink`.
    fn exec(&self, id: &str, spec: &ExecSpec, sink: LogAggregator) -> Result<ExecSession>;

    fn copy_to_container(
        &self,
        id: &str,
        host: &Path,
        container: &str,
        timeout: Duration,
    ) -> Result<()>;

    fn copy_from_container(
        &self,
        id: &str,
        container: &str,
        host: &Path,
        timeout: Duration,
    ) -> Result<()>;

    /// Whether the host daemon has `image` locally.
    fn image_present(&self, image: &str) -> Result<bool>;

    fn pull_image(&self, image: &str, timeout: Duration) -> Result<()>;

    /// Write `image` as a tar archive to `dest`.
    fn save_image(&self, image: &str, dest: &Path, timeout: Duration) -> Result<()>;
}

/// [`Engine`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    #[serde(default)]
    labels: String,
    state: ContainerState,
    created_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: ContainerState,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn capture(&self, args: &[String], timeout: Duration) -> Result<Captured> {
        run::capture(&self.binary, args, timeout)
    }

    /// Run a lifecycle command; failures carry the client's diagnostics.
    fn command(&self, args: Vec<String>, timeout: Duration) -> Result<String> {
        let out = self.capture(&args, timeout)?;
        let command = format!("{} {}", self.binary, shell_words::join(&args));
        if out.timed_out {
            return Err(Error::Timeout {
                description: command,
                timeout,
            });
        }
        if !out.success() {
            return Err(Error::CommandFailed {
                command,
                exit_code: out.exit_code,
                output: out.diagnostics(),
            });
        }
        Ok(out.stdout)
    }

    /// Run a discovery or inspection command; any failure means the engine
    /// is not usable.
    fn query(&self, args: Vec<String>) -> Result<String> {
        let out = self.capture(&args, QUERY_TIMEOUT)?;
        if out.timed_out {
            return Err(Error::EngineUnavailable(format!(
                "`{} {}` did not answer within {QUERY_TIMEOUT:?}",
                self.binary, args[0]
            )));
        }
        if !out.success() {
            return Err(Error::EngineUnavailable(out.diagnostics().join("; ")));
        }
        Ok(out.stdout)
    }

    fn transfer(&self, source: String, destination: String, timeout: Duration) -> Result<()> {
        let args = vec!["cp".to_string(), source.clone(), destination.clone()];
        self.command(args, timeout)
            .map(|_| ())
            .map_err(|e| Error::TransferFailed {
                source_path: source,
                destination,
                reason: match &e {
                    Error::CommandFailed { output, .. } if !output.is_empty() => output.join("; "),
                    _ => e.to_string(),
                },
            })
    }
}

/// `docker create` arguments for `spec`, excluding the leading `create`.
pub fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec!["--name".to_string(), spec.name.clone()];
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    if spec.privileged {
        args.push("--privileged".into());
    }
    if spec.host_pid {
        args.extend(["--pid".to_string(), "host".to_string()]);
    }
    if spec.host_network {
        args.extend(["--network".to_string(), "host".to_string()]);
    } else {
        for port in &spec.ports {
            args.extend(["--publish".into(), port.clone()]);
        }
    }
    for mount in &spec.mounts {
        args.push("--mount".into());
        args.push(match mount {
            Mount::Bind {
                host,
                container,
                propagation,
            } => {
                let mut m = format!(
                    "type=bind,source={},target={container}",
                    host.display()
                );
                if *propagation == Propagation::Rshared {
                    m.push_str(",bind-propagation=rshared");
                }
                m
            }
            Mount::Volume { name, container } => {
                format!("type=volume,source={name},target={container}")
            }
        });
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// `key=value,key2=value2` as printed by `docker ps`.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_ps(output: &str) -> Result<Vec<ContainerSummary>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let row: PsRow = serde_json::from_str(line)?;
            Ok(ContainerSummary {
                id: row.id,
                name: row.names.trim_start_matches('/').to_string(),
                labels: parse_labels(&row.labels),
                state: row.state,
                created: row.created_at,
            })
        })
        .collect()
}

/// An unreadable inspect answer means the engine is not behaving, not that
/// the container is gone.
fn parse_state(output: &str) -> Result<ContainerState> {
    serde_json::from_str::<InspectState>(output.trim())
        .map(|state| state.status)
        .map_err(|e| Error::EngineUnavailable(format!("unexpected inspect output: {e}")))
}

fn is_missing(out: &Captured) -> bool {
    let stderr = out.stderr.to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not found")
}

impl Engine for DockerCli {
    fn ping(&self) -> Result<()> {
        self.query(vec![
            "version".into(),
            "--format".into(),
            "{{.Server.Version}}".into(),
        ])
        .map(|version| debug!(version = %version.trim(), "docker daemon reachable"))
    }

    fn list_containers(&self, label: &str, name: &str) -> Result<Vec<ContainerSummary>> {
        let out = self.query(vec![
            "ps".into(),
            "--all".into(),
            "--no-trunc".into(),
            "--filter".into(),
            format!("label={label}"),
            "--filter".into(),
            format!("name=^{name}$"),
            "--format".into(),
            "{{json .}}".into(),
        ])?;
        parse_ps(&out)
    }

    fn inspect_state(&self, id: &str) -> Result<Option<ContainerState>> {
        let args = vec![
            "inspect".into(),
            "--type".into(),
            "container".into(),
            "--format".into(),
            "{{json .State}}".into(),
            id.to_string(),
        ];
        let out = self.capture(&args, QUERY_TIMEOUT)?;
        if out.success() {
            return parse_state(&out.stdout).map(Some);
        }
        if !out.timed_out && is_missing(&out) {
            return Ok(None);
        }
        Err(Error::EngineUnavailable(out.diagnostics().join("; ")))
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<String> {
        let mut args = vec!["create".to_string()];
        args.extend(create_args(spec));
        let out = self.command(args, LIFECYCLE_TIMEOUT)?;
        Ok(out.trim().to_string())
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.command(vec!["start".into(), id.into()], LIFECYCLE_TIMEOUT)
            .map(|_| ())
    }

    fn stop_container(&self, id: &str) -> Result<()> {
        self.command(vec!["stop".into(), id.into()], LIFECYCLE_TIMEOUT)
            .map(|_| ())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.command(
            vec!["rm".into(), "--force".into(), "--volumes".into(), id.into()],
            LIFECYCLE_TIMEOUT,
        )
        .map(|_| ())
    }

    fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        args.push(name.to_string());
        self.command(args, LIFECYCLE_TIMEOUT).map(|_| ())
    }

    fn volume_exists(&self, name: &str) -> Result<bool> {
        let out = self.query(vec![
            "volume".into(),
            "ls".into(),
            "--quiet".into(),
            "--filter".into(),
            format!("name=^{name}$"),
        ])?;
        Ok(out.lines().any(|l| l.trim() == name))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.command(
            vec!["volume".into(), "rm".into(), "--force".into(), name.into()],
            LIFECYCLE_TIMEOUT,
        )
        .map(|_| ())
    }

    fn follow_logs(
        &self,
        id: &str,
        since: SystemTime,
        sink: LogAggregator,
        cancel: CancelToken,
    ) -> Result<()> {
        let since = since
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let args = vec![
            "logs".into(),
            "--follow".into(),
            "--since".into(),
            since.to_string(),
            id.to_string(),
        ];
        run::stream(&self.binary, &args, sink, cancel).map(|_| ())
    }

    fn exec(&self, id: &str, spec: &ExecSpec, sink: LogAggregator) -> Result<ExecSession> {
        let mut args = vec!["exec".to_string()];
        if let Some(workdir) = &spec.workdir {
            args.extend(["--workdir".into(), workdir.clone()]);
        }
        for (key, value) in &spec.env {
            args.extend(["--env".into(), format!("{key}={value}")]);
        }
        args.push(id.to_string());
        args.extend(spec.command.iter().cloned());

        let cancel = CancelToken::new();
        let exit = run::stream(&self.binary, &args, sink, cancel.clone())?;
        Ok(ExecSession { exit, cancel })
    }

    fn copy_to_container(
        &self,
        id: &str,
        host: &Path,
        container: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.transfer(
            host.display().to_string(),
            format!("{id}:{container}"),
            timeout,
        )
    }

    fn copy_from_container(
        &self,
        id: &str,
        container: &str,
        host: &Path,
        timeout: Duration,
    ) -> Result<()> {
        self.transfer(
            format!("{id}:{container}"),
            host.display().to_string(),
            timeout,
        )
    }

    fn image_present(&self, image: &str) -> Result<bool> {
        let args = vec![
            "image".into(),
            "inspect".into(),
            "--format".into(),
            "{{.Id}}".into(),
            image.to_string(),
        ];
        let out = self.capture(&args, QUERY_TIMEOUT)?;
        if out.success() {
            return Ok(true);
        }
        if !out.timed_out && is_missing(&out) {
            return Ok(false);
        }
        Err(Error::EngineUnavailable(out.diagnostics().join("; ")))
    }

    fn pull_image(&self, image: &str, timeout: Duration) -> Result<()> {
        self.command(vec!["pull".into(), image.into()], timeout)
            .map(|_| ())
    }

    fn save_image(&self, image: &str, dest: &Path, timeout: Duration) -> Result<()> {
        self.command(
            vec![
                "save".into(),
                "--output".into(),
                dest.display().to_string(),
                image.into(),
            ],
            timeout,
        )
        .map(|_| ())
    }
}

/// Verify that the Docker daemon is reachable.
pub fn ensure_available(binary: &str) -> Result<()> {
    DockerCli::new(binary).ping()
}
