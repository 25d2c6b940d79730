//! Line reassembly for chunked container output.
mod aggregator;

pub use aggregator::{Chunk, LogAggregator, StreamKind};

/// Run `f` and count the warn and error events it emits on this thread.
#[cfg(test)]
pub(crate) fn count_warnings<T>(f: impl FnOnce() -> T) -> (T, usize) {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_subscriber::layer::{Context, SubscriberExt};

    struct Counter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Counter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() <= tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(Counter(count.clone()));
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, count.load(Ordering::SeqCst))
}
