//! A stage whose represented source can be swapped at runtime

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tailpipe_types::columns;
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{Column, EmptyReason, LogLineIndex, Modification, Property, Value};
use tokio_util::sync::CancellationToken;

use crate::engine::{LogSourceCore, RunOnce, StageOptions};
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::listener::{LogSourceListener, StageKey};
use crate::pending::PendingModifications;
use crate::scheduler::TaskScheduler;
use crate::source::{LogSource, clamp_indices, ensure_acyclic};

/// Forwards an inner source which may be replaced or removed at any time.
///
/// Replacing the inner source is announced as a reset followed by the full content of the new
/// one. Without an inner source the proxy is empty and reports
/// [`EmptyReason::SourceDoesNotExist`].
pub struct LogSourceProxy {
    core: LogSourceCore,
    options: StageOptions,
    pending: PendingModifications,
    inner: RwLock<Option<Arc<dyn LogSource>>>,

    /// Held while swapping the inner source or applying its modifications
    state: Mutex<()>,
    /// Rows of the inner source announced so far
    count: AtomicUsize,
}

impl LogSourceProxy {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        inner: Option<Arc<dyn LogSource>>,
        options: StageOptions,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self {
            core: LogSourceCore::new(scheduler),
            options,
            pending: PendingModifications::new(),
            inner: RwLock::new(None),
            state: Mutex::new(()),
            count: AtomicUsize::new(0),
        });
        if let Some(inner) = inner {
            proxy.attach(&inner);
            *proxy.inner.write() = Some(inner);
        }
        proxy.core.start("proxy", &proxy);
        proxy
    }

    pub fn inner(&self) -> Option<Arc<dyn LogSource>> {
        self.inner.read().clone()
    }

    /// Represent `inner` from now on.
    ///
    /// Fails with [`LogSourceError::Cycle`] if `inner` listens to this proxy, directly or not.
    pub fn set_inner(&self, inner: Option<Arc<dyn LogSource>>) -> Result<()> {
        if let Some(inner) = &inner {
            ensure_acyclic(inner.as_ref(), self.key())?;
        }
        if self.core.is_disposed() {
            return Ok(());
        }

        let _state = self.state.lock();
        let previous = std::mem::replace(&mut *self.inner.write(), inner.clone());
        if let Some(previous) = previous {
            previous.remove_listener(&self.pending.listener());
        }
        self.count.store(0, Ordering::Release);
        self.core.listeners().reset();
        self.core.reset_end_of_source_reached();
        if let Some(inner) = &inner {
            self.attach(inner);
        }
        Ok(())
    }

    fn attach(&self, inner: &Arc<dyn LogSource>) {
        inner.add_listener(
            self.pending.listener(),
            self.options.max_wait,
            self.options.batch_size,
        );
    }

    /// Publishes the new count before notifying; listeners may read it back
    fn apply(&self, modification: Modification) {
        let listeners = self.core.listeners();
        let count = self.count.load(Ordering::Acquire);
        match modification {
            Modification::Reset => {
                self.count.store(0, Ordering::Release);
                listeners.reset();
            }
            Modification::Invalidated(section) => {
                let first = section.index.as_usize().unwrap_or(0);
                if first < count {
                    self.count.store(first, Ordering::Release);
                    listeners.invalidate(first, count - first);
                }
            }
            Modification::Appended(section) => {
                let count = count.max(section.end());
                self.count.store(count, Ordering::Release);
                listeners.on_read_count(count);
            }
        }
    }
}

impl RunOnce for LogSourceProxy {
    fn run_once(&self, _token: &CancellationToken) -> Duration {
        let _state = self.state.lock();
        let inner = self.inner.read().clone();
        let current = inner.as_ref().map(|inner| inner.key());

        let mut applied = 0;
        for (sender, modification) in self.pending.drain() {
            if Some(sender) != current {
                tracing::debug!(
                    ?sender,
                    ?modification,
                    "Ignoring modification from a previous inner source"
                );
                continue;
            }
            self.apply(modification);
            applied += 1;
        }

        let caught_up = match &inner {
            Some(inner) => {
                inner.end_of_source_reached()
                    && self.pending.is_empty()
                    && self.count.load(Ordering::Acquire) == inner.count()
            }
            None => true,
        };
        if caught_up {
            self.core.set_end_of_source_reached();
        } else {
            self.core.reset_end_of_source_reached();
        }

        if applied > 0 {
            Duration::ZERO
        } else {
            self.options.idle_delay
        }
    }
}

impl LogSource for LogSourceProxy {
    fn key(&self) -> StageKey {
        self.core.key()
    }

    fn columns(&self) -> Vec<Column> {
        match self.inner() {
            Some(inner) => inner.columns(),
            None => columns::MINIMUM.to_vec(),
        }
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) {
        self.core.add_listener(listener, max_wait, max_line_count);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) {
        self.core.remove_listener(listener);
    }

    fn properties(&self) -> Vec<Property> {
        match self.inner() {
            Some(inner) => inner.properties(),
            None => properties::MINIMUM.to_vec(),
        }
    }

    fn get_property(&self, property: Property) -> Result<Value> {
        match self.inner() {
            Some(inner) => inner.get_property(property),
            None => empty_properties()
                .get(property)
                .cloned()
                .ok_or(LogSourceError::NoSuchProperty(property.id())),
        }
    }

    fn get_all_properties(&self, destination: &mut PropertiesBuffer) {
        match self.inner() {
            Some(inner) => inner.get_all_properties(destination),
            None => empty_properties().copy_all_to(destination),
        }
    }

    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut [Value],
    ) -> Result<()> {
        ensure_capacity(indices.len(), destination.len())?;
        let count = self.count.load(Ordering::Acquire);
        match self.inner() {
            Some(inner) => inner.get_column(&clamp_indices(indices, count), column, destination),
            None => {
                if !columns::MINIMUM.contains(&column) {
                    return Err(LogSourceError::NoSuchColumn(column.id()));
                }
                destination[..indices.len()].fill(column.default_value());
                Ok(())
            }
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn end_of_source_reached(&self) -> bool {
        self.core.end_of_source_reached()
    }

    fn upstream(&self) -> Vec<Arc<dyn LogSource>> {
        self.inner().into_iter().collect()
    }

    fn dispose(&self) {
        if self.core.dispose() {
            if let Some(inner) = self.inner.write().take() {
                inner.remove_listener(&self.pending.listener());
            }
            self.count.store(0, Ordering::Release);
        }
    }
}

impl Drop for LogSourceProxy {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Properties reported while there is no inner source
fn empty_properties() -> PropertiesBuffer {
    let mut buffer = PropertiesBuffer::minimum();
    buffer.set(
        &properties::EMPTY_REASON,
        Value::EmptyReason(Some(EmptyReason::SourceDoesNotExist)),
    );
    buffer.set(&properties::PERCENTAGE_PROCESSED, Value::Percentage(1.0));
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtered::FilteredLogSource;
    use crate::listener::testing::RecordingListener;
    use crate::memory::InMemoryLogSource;
    use crate::scheduler::ManualTaskScheduler;
    use crate::source::LogSourceExt;
    use pretty_assertions::assert_eq;
    use std::sync::{Weak, mpsc};
    use tailpipe_types::{LogEntry, LogSourceSection};

    /// Reads the proxy's count from within its own notifications
    struct ReadingListener {
        proxy: Mutex<Weak<LogSourceProxy>>,
        counts: Mutex<Vec<usize>>,
    }

    impl LogSourceListener for ReadingListener {
        fn on_log_source_modified(&self, _source: StageKey, _modification: Modification) {
            if let Some(proxy) = self.proxy.lock().upgrade() {
                self.counts.lock().push(proxy.count());
            }
        }
    }

    fn memory(lines: &[&str]) -> Arc<InMemoryLogSource> {
        let source = Arc::new(InMemoryLogSource::new());
        for line in lines {
            source.add(
                &LogEntry::new().with(&columns::RAW_CONTENT, Value::Text(Some(line.to_string()))),
            );
        }
        source
    }

    fn contents(source: &dyn LogSource) -> Vec<String> {
        source
            .get_column_in(LogSourceSection::new(0, source.count()), &columns::RAW_CONTENT)
            .unwrap()
            .into_iter()
            .map(|v| v.into_text().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_forwards_inner() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let inner = memory(&["a", "b"]);
        let proxy =
            LogSourceProxy::new(scheduler.clone(), Some(inner.clone()), StageOptions::default());

        scheduler.run_once();
        assert_eq!(contents(proxy.as_ref()), vec!["a", "b"]);
        assert!(proxy.end_of_source_reached());

        inner.add(&LogEntry::new().with(&columns::RAW_CONTENT, Value::Text(Some("c".into()))));
        // Not announced yet
        assert_eq!(proxy.count(), 2);
        scheduler.run_once();
        assert_eq!(contents(proxy.as_ref()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_swap_resets_and_replays() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let first = memory(&["a", "b"]);
        let second = memory(&["x"]);
        let proxy = LogSourceProxy::new(scheduler.clone(), Some(first), StageOptions::default());
        let listener = RecordingListener::new();
        proxy.add_listener(listener.clone(), Duration::ZERO, 100);
        scheduler.run_once();

        proxy.set_inner(Some(second)).unwrap();
        scheduler.run_once();

        assert_eq!(contents(proxy.as_ref()), vec!["x"]);
        assert_eq!(
            listener.modifications(),
            vec![
                Modification::Reset,
                Modification::appended(0, 2),
                Modification::Reset,
                Modification::appended(0, 1)
            ]
        );
    }

    #[test]
    fn test_stale_modifications_are_ignored() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let first = memory(&[]);
        let second = memory(&["x"]);
        let proxy =
            LogSourceProxy::new(scheduler.clone(), Some(first.clone()), StageOptions::default());

        // Queued while `first` is still the inner source, processed after the swap
        first.add(&LogEntry::new().with(&columns::RAW_CONTENT, Value::Text(Some("a".into()))));
        first.add(&LogEntry::new().with(&columns::RAW_CONTENT, Value::Text(Some("b".into()))));
        proxy.set_inner(Some(second)).unwrap();
        scheduler.run_once();

        assert_eq!(contents(proxy.as_ref()), vec!["x"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let proxy = LogSourceProxy::new(scheduler.clone(), None, StageOptions::default());
        let filtered: Arc<dyn LogSource> = FilteredLogSource::new(
            scheduler.clone(),
            proxy.clone(),
            None,
            None,
            StageOptions::default(),
        );

        assert!(matches!(
            proxy.set_inner(Some(filtered)),
            Err(LogSourceError::Cycle)
        ));
        assert!(matches!(
            proxy.set_inner(Some(proxy.clone())),
            Err(LogSourceError::Cycle)
        ));
        assert!(proxy.inner().is_none());
    }

    #[test]
    fn test_without_inner() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let proxy = LogSourceProxy::new(scheduler.clone(), None, StageOptions::default());
        scheduler.run_once();

        assert_eq!(proxy.count(), 0);
        assert!(proxy.end_of_source_reached());
        assert_eq!(
            proxy.property_or_default(&properties::EMPTY_REASON),
            Value::EmptyReason(Some(EmptyReason::SourceDoesNotExist))
        );
        assert_eq!(
            proxy.property_or_default(&properties::PERCENTAGE_PROCESSED),
            Value::Percentage(1.0)
        );

        let mut values = vec![Value::Integer(3); 1];
        proxy
            .get_column(&[LogLineIndex::new(0)], &columns::TIMESTAMP, &mut values)
            .unwrap();
        assert_eq!(values, vec![Value::Timestamp(None)]);
    }

    #[test]
    fn test_remove_inner() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let inner = memory(&["a"]);
        let proxy =
            LogSourceProxy::new(scheduler.clone(), Some(inner.clone()), StageOptions::default());
        scheduler.run_once();

        proxy.set_inner(None).unwrap();
        scheduler.run_once();
        assert_eq!(proxy.count(), 0);
        assert!(proxy.upstream().is_empty());

        // `inner` no longer reaches the proxy
        inner.add(&LogEntry::new().with(&columns::RAW_CONTENT, Value::Text(Some("b".into()))));
        scheduler.run_once();
        assert_eq!(proxy.count(), 0);
    }

    #[test]
    fn test_listener_reads_proxy_while_notified() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let proxy = LogSourceProxy::new(
            scheduler.clone(),
            Some(memory(&["a", "b"])),
            StageOptions::default(),
        );
        let listener = Arc::new(ReadingListener {
            proxy: Mutex::new(Arc::downgrade(&proxy)),
            counts: Mutex::new(Vec::new()),
        });
        proxy.add_listener(listener.clone(), Duration::ZERO, 100);

        let (done, finished) = mpsc::channel();
        let worker = {
            let scheduler = scheduler.clone();
            let proxy = proxy.clone();
            std::thread::spawn(move || {
                scheduler.run_once();
                proxy.set_inner(Some(memory(&["x"]))).unwrap();
                scheduler.run_once();
                let _ = done.send(());
            })
        };
        assert!(
            finished.recv_timeout(Duration::from_secs(5)).is_ok(),
            "proxy blocked while notifying"
        );
        worker.join().unwrap();

        // Reset on registration, the first inner, then the swap
        assert_eq!(*listener.counts.lock(), vec![0, 2, 0, 1]);
    }
}
