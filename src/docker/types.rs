use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

/// Cooperative cancellation token backed by an `AtomicBool`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Lifecycle state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    /// Transitional `removing` state, or anything newer engines invent.
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    pub fn is_running(self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Restarting)
    }
}

/// A resolved reference to the cluster container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    /// Engine-formatted creation time; sorts chronologically.
    pub created: String,
}

impl From<ContainerSummary> for ContainerHandle {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            id: summary.id,
            name: summary.name,
            labels: summary.labels,
            state: summary.state,
        }
    }
}

/// Mount propagation for bind mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Private,
    Rshared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    Bind {
        host: PathBuf,
        container: String,
        propagation: Propagation,
    },
    Volume {
        name: String,
        container: String,
    },
}

/// Everything needed to create the cluster container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// `host:container` pairs. Ignored with host networking.
    pub ports: Vec<String>,
    pub command: Vec<String>,
    pub privileged: bool,
    pub host_pid: bool,
    pub host_network: bool,
}

/// A command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ExecSpec {
    /// Command line for diagnostics.
    pub fn display(&self) -> String {
        shell_words::join(&self.command)
    }
}

/// Exit code of a streamed process, filled in once it has exited.
#[derive(Debug, Clone, Default)]
pub struct ExitCell(Arc<Mutex<Option<i32>>>);

impl ExitCell {
    pub fn set(&self, code: Option<i32>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = code;
        }
    }

    pub fn get(&self) -> Option<i32> {
        self.0.lock().ok().and_then(|slot| *slot)
    }
}

/// Handle on a running exec session.
///
/// Output flows into the aggregator given to
/// [`Engine::exec`](super::Engine::exec); the exit code is published to
/// `exit` before that aggregator is marked completed.
#[derive(Debug, Clone)]
pub struct ExecSession {
    pub exit: ExitCell,
    pub cancel: CancelToken,
}

/// Output of a finished exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub messages: Vec<String>,
}
