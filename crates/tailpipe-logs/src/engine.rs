//! The periodic engine shared by every stage

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::listener::{LogSourceListener, LogSourceListenerCollection, StageKey};
use crate::scheduler::{TaskHandle, TaskScheduler};

/// Delay returned by a task whose stage has already gone away
const ORPHANED_DELAY: Duration = Duration::from_secs(10);

/// Batching and polling knobs shared by the derived stages
#[derive(Clone, Debug)]
pub struct StageOptions {
    /// Upper bound of upstream lines handled per pass
    pub batch_size: usize,

    /// Throttle requested from the upstream source
    pub max_wait: Duration,

    /// Delay before the next pass when there was nothing to do
    pub idle_delay: Duration,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_wait: Duration::ZERO,
            idle_delay: Duration::from_millis(10),
        }
    }
}

impl StageOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }
}

/// A single bounded pass of a stage's work
pub trait RunOnce: Send + Sync + 'static {
    /// Process at most one batch and return the delay until the next pass
    fn run_once(&self, token: &CancellationToken) -> Duration;
}

/// Scheduling, listeners and lifecycle of one stage
pub struct LogSourceCore {
    key: StageKey,
    scheduler: Arc<dyn TaskScheduler>,
    listeners: LogSourceListenerCollection,
    cancel: CancellationToken,
    task: Mutex<Option<TaskHandle>>,
    end_of_source_reached: AtomicBool,
    disposed: AtomicBool,
}

impl LogSourceCore {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        let key = StageKey::next();
        Self {
            key,
            scheduler,
            listeners: LogSourceListenerCollection::new(key),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            end_of_source_reached: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> StageKey {
        self.key
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    /// Register the stage's periodic task.
    ///
    /// The task only holds a weak reference, so dropping the last handle to the stage
    /// disposes it.
    pub fn start<T: RunOnce>(&self, name: &str, stage: &Arc<T>) {
        let stage: Weak<T> = Arc::downgrade(stage);
        let token = self.cancel.clone();
        let handle = self.scheduler.start_periodic(
            name,
            Box::new(move || {
                if token.is_cancelled() {
                    return ORPHANED_DELAY;
                }
                match stage.upgrade() {
                    Some(stage) => stage.run_once(&token),
                    None => ORPHANED_DELAY,
                }
            }),
        );
        *self.task.lock() = Some(handle);
    }

    pub fn listeners(&self) -> &LogSourceListenerCollection {
        &self.listeners
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) {
        if self.is_disposed() {
            return;
        }
        self.listeners
            .add_listener(listener, max_wait, max_line_count);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) {
        self.listeners.remove_listener(listener);
    }

    pub fn end_of_source_reached(&self) -> bool {
        self.end_of_source_reached.load(Ordering::Acquire)
    }

    /// Latch end-of-source, flushing pending notifications first
    pub fn set_end_of_source_reached(&self) {
        if self.end_of_source_reached() {
            return;
        }
        self.listeners.flush();
        self.end_of_source_reached.store(true, Ordering::Release);
    }

    pub fn reset_end_of_source_reached(&self) {
        self.end_of_source_reached.store(false, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Cancel and stop the task and drop every listener.
    ///
    /// Returns true only for the first call so the stage releases its own resources once.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            self.scheduler.stop_periodic(handle);
        }
        self.listeners.clear();
        true
    }
}
