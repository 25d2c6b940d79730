//! Blocking poll-until-ready primitive.
//!
//! Turns asynchronous container and cluster state into synchronous
//! checkpoints: poll a fallible check until its value is accepted or a
//! wall-clock budget runs out. Only time bounds the loop, never an attempt
//! count.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};

type TimeoutHook = Box<dyn FnOnce() + Send>;

/// Parameters of a single wait.
pub struct AwaitSpec {
    pub description: String,
    pub timeout: Duration,
    /// Wait before the first check.
    pub poll_delay: Duration,
    /// Wait before every check.
    pub poll_interval: Duration,
    on_timeout: Option<TimeoutHook>,
}

impl AwaitSpec {
    pub fn new(description: impl Into<String>, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            timeout,
            poll_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(500),
            on_timeout: None,
        }
    }

    pub fn poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `hook` once if the wait gives up, before the error is returned.
    pub fn on_timeout(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for AwaitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitSpec")
            .field("description", &self.description)
            .field("timeout", &self.timeout)
            .field("poll_delay", &self.poll_delay)
            .field("poll_interval", &self.poll_interval)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

/// Poll `check` until `accept` approves its value.
///
/// Retryable errors from `check` count as "not yet" and polling continues.
/// Errors where [`Error::is_retryable`] is false end the wait immediately.
pub fn await_value<V, C, A>(spec: AwaitSpec, mut check: C, accept: A) -> Result<V>
where
    C: FnMut() -> Result<V>,
    A: Fn(&V) -> bool,
{
    let AwaitSpec {
        description,
        timeout,
        poll_delay,
        poll_interval,
        on_timeout,
    } = spec;

    let start = Instant::now();
    std::thread::sleep(poll_delay);

    let mut attempt: u64 = 0;
    loop {
        std::thread::sleep(poll_interval);
        attempt += 1;

        match check() {
            Ok(value) if accept(&value) => {
                debug!(
                    description = %description,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "wait satisfied"
                );
                return Ok(value);
            }
            Ok(_) => trace!(description = %description, attempt, "not ready yet"),
            Err(e) if e.is_retryable() => {
                trace!(description = %description, attempt, error = %e, "check failed, retrying")
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            if let Some(hook) = on_timeout {
                hook();
            }
            return Err(Error::Timeout {
                description,
                timeout,
            });
        }
    }
}

/// Poll a boolean check until it reports `true`.
pub fn await_true<C>(spec: AwaitSpec, check: C) -> Result<()>
where
    C: FnMut() -> Result<bool>,
{
    await_value(spec, check, |ready| *ready).map(|_| ())
}
