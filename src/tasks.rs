//! Fan-out of independent units of work.
//!
//! Every task runs on its own thread and every task runs to completion: a
//! failing image import or restart must not hide the outcome of its
//! siblings.

use std::thread;

use tracing::{debug, error};

use crate::error::Result;

type Work = Box<dyn FnOnce() -> Result<bool> + Send>;

/// A named, result-producing unit of work.
pub struct Task {
    pub name: String,
    work: Work,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        work: impl FnOnce() -> Result<bool> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            work: Box::new(work),
        }
    }
}

/// Outcome of a single task after [`run_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub success: bool,
}

/// Run all tasks in parallel, wait for every one of them, and report each.
///
/// Errors and panics inside a task are logged and recorded as failure;
/// they never propagate and never cancel the other tasks.
pub fn run_all(tasks: Vec<Task>) -> Vec<TaskReport> {
    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let name = task.name.clone();
            let work = task.work;
            let handle = thread::Builder::new()
                .name(format!("task-{name}"))
                .spawn(work);
            (name, handle)
        })
        .collect();

    handles
        .into_iter()
        .map(|(name, handle)| {
            let success = match handle {
                Ok(handle) => match handle.join() {
                    Ok(Ok(success)) => success,
                    Ok(Err(e)) => {
                        for line in e.output() {
                            error!(task = %name, "{line}");
                        }
                        error!(task = %name, error = %e, "task failed");
                        false
                    }
                    Err(_) => {
                        error!(task = %name, "task panicked");
                        false
                    }
                },
                Err(e) => {
                    error!(task = %name, error = %e, "failed to spawn task thread");
                    false
                }
            };
            debug!(task = %name, success, "task finished");
            TaskReport { name, success }
        })
        .collect()
}
