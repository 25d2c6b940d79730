use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{Error, Result};
use crate::logs::{Chunk, LogAggregator, StreamKind};

use super::types::{CancelToken, ExitCell};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_BUFFER: usize = 8 * 1024;

/// Outcome of a captured (non-streaming) client invocation.
#[derive(Debug, Default)]
pub struct Captured {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Non-blank stderr lines, falling back to stdout.
    pub fn diagnostics(&self) -> Vec<String> {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }
}

fn spawn_piped(binary: &str, args: &[String]) -> Result<Child> {
    trace!(binary, args = %shell_words::join(args), "spawning");
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::EngineUnavailable(format!("`{binary}` is not installed or not on PATH"))
            }
            _ => Error::EngineUnavailable(format!("failed to spawn `{binary}`: {e}")),
        })
}

/// Run the client to completion, collecting stdout and stderr.
///
/// The client is killed once `timeout` elapses; `timed_out` is then set.
pub fn capture(binary: &str, args: &[String], timeout: Duration) -> Result<Captured> {
    let mut child = spawn_piped(binary, args)?;

    let stdout = child.stdout.take().map(collect_text);
    let stderr = child.stderr.take().map(collect_text);

    let start = Instant::now();
    let mut timed_out = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if start.elapsed() > timeout {
            timed_out = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(Captured {
        exit_code: exit_status.and_then(|s| s.code()),
        stdout: join_text(stdout),
        stderr: join_text(stderr),
        timed_out,
    })
}

fn collect_text<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_text(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Run the client in the background, feeding raw output chunks to `sink`.
///
/// The exit code lands in the returned cell before `sink` is completed.
/// Cancelling `cancel` kills the client process.
pub fn stream(
    binary: &str,
    args: &[String],
    sink: LogAggregator,
    cancel: CancelToken,
) -> Result<ExitCell> {
    let mut child = spawn_piped(binary, args)?;
    let exit = ExitCell::default();

    // Both pipes feed the same aggregator; the lock serializes chunks.
    let gate = Arc::new(Mutex::new(()));
    let readers: Vec<_> = [
        child
            .stdout
            .take()
            .map(|r| pump(r, StreamKind::Stdout, sink.clone(), gate.clone())),
        child
            .stderr
            .take()
            .map(|r| pump(r, StreamKind::Stderr, sink.clone(), gate.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let exit_out = exit.clone();
    std::thread::spawn(move || {
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code(),
                Ok(None) => {}
                Err(_) => break None,
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        for reader in readers {
            let _ = reader.join();
        }
        exit_out.set(status);
        sink.complete();
    });

    Ok(exit)
}

fn pump<R: Read + Send + 'static>(
    mut reader: R,
    stream: StreamKind,
    sink: LogAggregator,
    gate: Arc<Mutex<()>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _guard = gate.lock();
                    sink.accept(Chunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    });
                }
            }
        }
    })
}
