//! Diagnostic output.
//!
//! Binaries call [`init`] once. Embedders that want engine logs routed
//! somewhere specific build their own [`Dispatch`] and [`install`] it for as
//! long as the returned guard lives. Sessions remember the dispatcher that was
//! current when they were loaded and re-enter it on their worker threads.

use tracing::dispatcher::{self, DefaultGuard};
pub use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Returns false if a global subscriber was already set.
pub fn init(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Scoped sink; dropping it restores the previous dispatcher.
#[must_use = "the sink is uninstalled when the guard is dropped"]
pub struct SinkGuard {
    _guard: DefaultGuard,
}

pub fn install(dispatch: Dispatch) -> SinkGuard {
    SinkGuard {
        _guard: dispatcher::set_default(&dispatch),
    }
}

/// The dispatcher active on this thread.
pub fn current() -> Dispatch {
    dispatcher::get_default(Dispatch::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::span;
    use tracing::subscriber::Subscriber;

    struct Counter(Arc<AtomicUsize>);

    impl Subscriber for Counter {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _: &span::Attributes<'_>) -> span::Id {
            span::Id::from_u64(1)
        }
        fn record(&self, _: &span::Id, _: &span::Record<'_>) {}
        fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}
        fn event(&self, _: &tracing::Event<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn enter(&self, _: &span::Id) {}
        fn exit(&self, _: &span::Id) {}
    }

    #[test]
    fn installed_sink_sees_events_until_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let guard = install(Dispatch::new(Counter(count.clone())));
        tracing::warn!("one");
        let captured = current();
        let handle = std::thread::spawn(move || {
            dispatcher::with_default(&captured, || tracing::warn!("from worker"));
        });
        handle.join().unwrap();
        drop(guard);
        tracing::warn!("not counted");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
