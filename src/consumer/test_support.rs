//! Log capture helpers for unit tests

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Records the level of every event emitted while installed
#[derive(Clone, Default)]
pub(crate) struct LevelCapture {
    levels: Arc<Mutex<Vec<Level>>>,
}

impl LevelCapture {
    /// Install as the thread's default subscriber until the guard drops
    pub(crate) fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub(crate) fn levels(&self) -> Vec<Level> {
        self.levels.lock().clone()
    }

    pub(crate) fn count(&self, level: Level) -> usize {
        self.levels.lock().iter().filter(|l| **l == level).count()
    }
}

impl<S: Subscriber> Layer<S> for LevelCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.levels.lock().push(*event.metadata().level());
    }
}

/// Run `f` with a capturing subscriber and return its result plus the levels logged
pub(crate) fn capture_levels<T>(f: impl FnOnce() -> T) -> (T, Vec<Level>) {
    let (capture, guard) = LevelCapture::install();
    let out = f();
    drop(guard);
    (out, capture.levels())
}
