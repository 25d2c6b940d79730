use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{Level, debug, error, info, trace, warn};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A raw fragment of process output. Not aligned to line boundaries.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

impl Chunk {
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            bytes: bytes.into(),
        }
    }

    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: Vec<u8>,
    lines: Vec<String>,
    completed: bool,
}

/// Reassembles line-oriented output from chunked streams.
///
/// One partial-line buffer is shared by all streams feeding the aggregator,
/// because the source interleaves stdout and stderr into one sequence.
/// Cloning yields another handle to the same buffer, so a reader thread can
/// append while the waiting thread polls [`is_completed`](Self::is_completed).
#[derive(Debug, Clone)]
pub struct LogAggregator {
    label: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl LogAggregator {
    /// `label` names the source in progress and replay output.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking reader thread must not take captured output with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one raw chunk.
    pub fn accept(&self, chunk: Chunk) {
        if chunk.bytes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.pending.extend_from_slice(&chunk.bytes);
        if chunk.bytes.last() == Some(&b'\n') {
            let buffered = std::mem::take(&mut inner.pending);
            self.flush(&mut inner, &buffered);
        }
    }

    /// Mark the stream finished, flushing any unterminated trailing line.
    pub fn complete(&self) {
        let mut inner = self.lock();
        if inner.completed {
            return;
        }
        let buffered = std::mem::take(&mut inner.pending);
        self.flush(&mut inner, &buffered);
        inner.completed = true;
        trace!(source = %self.label, lines = inner.lines.len(), "stream completed");
    }

    fn flush(&self, inner: &mut Inner, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!(source = %self.label, "{line}");
            inner.lines.push(line.to_string());
        }
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// All flushed lines, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    /// Whether any flushed line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().lines.iter().any(|line| line.contains(needle))
    }

    /// Re-emit every captured line at `level`.
    ///
    /// Used when an operation fails or times out, so output that was only
    /// visible at debug level reaches the operator.
    pub fn replay(&self, level: Level) {
        let lines = self.messages();
        for line in &lines {
            if level == Level::ERROR {
                error!(source = %self.label, "{line}");
            } else if level == Level::WARN {
                warn!(source = %self.label, "{line}");
            } else if level == Level::INFO {
                info!(source = %self.label, "{line}");
            } else if level == Level::DEBUG {
                debug!(source = %self.label, "{line}");
            } else {
                trace!(source = %self.label, "{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(agg: &LogAggregator, chunks: &[&str]) {
        for chunk in chunks {
            agg.accept(Chunk::stdout(chunk.as_bytes()));
        }
    }

    #[test]
    fn joins_fragments_and_splits_embedded_newlines() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["foo", "bar\n", "baz\nqux\n"]);
        assert_eq!(agg.messages(), vec!["foobar", "baz", "qux"]);
        assert!(!agg.is_completed());
    }

    #[test]
    fn unterminated_chunk_waits_for_more_data() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["partial"]);
        assert!(agg.messages().is_empty());
    }

    #[test]
    fn completion_flushes_trailing_line() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["first\n", "last line"]);
        agg.complete();
        assert_eq!(agg.messages(), vec!["first", "last line"]);
        assert!(agg.is_completed());
    }

    #[test]
    fn trims_whitespace_and_drops_blank_lines() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["  padded  \r\n", "\n", "   \n", "\tnext\n"]);
        assert_eq!(agg.messages(), vec!["padded", "next"]);
    }

    #[test]
    fn streams_share_one_pending_buffer() {
        let agg = LogAggregator::new("test");
        agg.accept(Chunk::stdout("out-"));
        agg.accept(Chunk::stderr("err\n"));
        assert_eq!(agg.messages(), vec!["out-err"]);
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let agg = LogAggregator::new("test");
        let bytes = "grüße\n".as_bytes();
        agg.accept(Chunk::stdout(&bytes[..3]));
        agg.accept(Chunk::stdout(&bytes[3..]));
        assert_eq!(agg.messages(), vec!["grüße"]);
    }

    #[test]
    fn complete_is_idempotent() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["tail"]);
        agg.complete();
        agg.complete();
        assert_eq!(agg.messages(), vec!["tail"]);
    }

    #[test]
    fn clones_share_state_across_threads() {
        let agg = LogAggregator::new("test");
        let producer = agg.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                producer.accept(Chunk::stdout(format!("line {i}\n")));
            }
            producer.complete();
        })
        .join()
        .unwrap();

        assert!(agg.is_completed());
        let lines = agg.messages();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[99], "line 99");
    }

    #[test]
    fn contains_matches_substrings_of_flushed_lines() {
        let agg = LogAggregator::new("k3s");
        feed(&agg, &["level=info msg=\"k3s is up and running\"\n"]);
        assert!(agg.contains("k3s is up and running"));
        assert!(!agg.contains("not there"));
    }

    #[test]
    fn replay_does_not_consume_lines() {
        let agg = LogAggregator::new("test");
        feed(&agg, &["a\n", "b\n"]);
        agg.replay(Level::WARN);
        assert_eq!(agg.messages(), vec!["a", "b"]);
    }
}
