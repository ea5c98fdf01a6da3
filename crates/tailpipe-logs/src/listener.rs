//! Throttled change notification

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tailpipe_types::{LogSourceSection, Modification};

/// Process-unique identity of a log source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageKey(u64);

impl StageKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives changes of a log source
pub trait LogSourceListener: Send + Sync {
    fn on_log_source_modified(&self, source: StageKey, modification: Modification);
}

fn same_listener(a: &Arc<dyn LogSourceListener>, b: &Arc<dyn LogSourceListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ============================================================================
// Notifier
// ============================================================================

/// Delivers one listener's notifications according to its throttle policy
pub struct ListenerNotifier {
    source: StageKey,
    listener: Arc<dyn LogSourceListener>,
    max_wait: Duration,
    max_line_count: usize,

    /// Rows delivered so far; -1 right after a reset has been delivered
    last_number_of_lines: i64,

    last_delivery: Instant,
}

impl ListenerNotifier {
    /// Create a notifier, delivering the initial reset right away
    pub fn new(
        source: StageKey,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) -> Self {
        let notifier = Self {
            source,
            listener,
            max_wait,
            max_line_count: max_line_count.max(1),
            last_number_of_lines: -1,
            last_delivery: Instant::now(),
        };
        notifier.emit(Modification::Reset);
        notifier
    }

    pub fn listener(&self) -> &Arc<dyn LogSourceListener> {
        &self.listener
    }

    /// Number of rows the listener has been told about
    pub fn last_number_of_lines(&self) -> i64 {
        self.last_number_of_lines.max(0)
    }

    /// The source now holds `count` rows; -1 means it was reset
    pub fn on_read(&mut self, count: i64) {
        if count < 0 {
            self.reset();
            return;
        }
        let reported = self.last_number_of_lines();
        if count < reported {
            self.invalidate(count, reported - count);
            return;
        }

        let elapsed = self.last_delivery.elapsed();
        let mut pending = count - reported;
        let chunk = self.max_line_count as i64;
        while pending >= chunk {
            self.deliver_appended(chunk);
            pending -= chunk;
        }
        if pending > 0 && elapsed >= self.max_wait {
            self.deliver_appended(pending);
        }
    }

    /// Rows from `first` onward are gone; only rows already delivered are invalidated
    pub fn invalidate(&mut self, first: i64, _count: i64) {
        if self.last_number_of_lines < 0 || first < 0 || first >= self.last_number_of_lines {
            return;
        }
        let removed = self.last_number_of_lines - first;
        self.emit(Modification::Invalidated(LogSourceSection::new(
            first as usize,
            removed as usize,
        )));
        self.last_number_of_lines = first;
        self.last_delivery = Instant::now();
    }

    /// Deliver everything up to `count` regardless of the throttle policy
    pub fn flush(&mut self, count: i64) {
        if count < 0 {
            self.reset();
            return;
        }
        let chunk = self.max_line_count as i64;
        let mut pending = count - self.last_number_of_lines();
        while pending > 0 {
            let next = pending.min(chunk);
            self.deliver_appended(next);
            pending -= next;
        }
    }

    fn reset(&mut self) {
        if self.last_number_of_lines == -1 {
            return;
        }
        self.emit(Modification::Reset);
        self.last_number_of_lines = -1;
        self.last_delivery = Instant::now();
    }

    fn deliver_appended(&mut self, count: i64) {
        let start = self.last_number_of_lines();
        self.emit(Modification::Appended(LogSourceSection::new(
            start as usize,
            count as usize,
        )));
        self.last_number_of_lines = start + count;
        self.last_delivery = Instant::now();
    }

    fn emit(&self, modification: Modification) {
        self.listener
            .on_log_source_modified(self.source, modification);
    }
}

// ============================================================================
// Collection
// ============================================================================

struct CollectionState {
    notifiers: Vec<ListenerNotifier>,
    current_line_index: i64,
}

/// The listeners of one log source
pub struct LogSourceListenerCollection {
    source: StageKey,
    state: Mutex<CollectionState>,
}

impl LogSourceListenerCollection {
    pub fn new(source: StageKey) -> Self {
        Self {
            source,
            state: Mutex::new(CollectionState {
                notifiers: Vec::new(),
                current_line_index: 0,
            }),
        }
    }

    /// Register `listener`; registering the same listener twice has no effect
    pub fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) {
        let mut state = self.state.lock();
        if state
            .notifiers
            .iter()
            .any(|n| same_listener(n.listener(), &listener))
        {
            return;
        }
        let mut notifier = ListenerNotifier::new(self.source, listener, max_wait, max_line_count);
        notifier.on_read(state.current_line_index);
        state.notifiers.push(notifier);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        let mut state = self.state.lock();
        let before = state.notifiers.len();
        state
            .notifiers
            .retain(|n| !same_listener(n.listener(), listener));
        state.notifiers.len() != before
    }

    pub fn clear(&self) {
        self.state.lock().notifiers.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_line_index(&self) -> i64 {
        self.state.lock().current_line_index
    }

    /// The source now holds `count` rows; -1 signals a reset
    pub fn on_read(&self, count: i64) {
        let mut state = self.state.lock();
        state.current_line_index = count;
        for notifier in &mut state.notifiers {
            notifier.on_read(count);
        }
    }

    pub fn on_read_count(&self, count: usize) {
        self.on_read(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Rows from `first` onward are no longer valid
    pub fn invalidate(&self, first: usize, count: usize) {
        let first = i64::try_from(first).unwrap_or(i64::MAX);
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut state = self.state.lock();
        state.current_line_index = first;
        for notifier in &mut state.notifiers {
            notifier.invalidate(first, count);
        }
    }

    pub fn reset(&self) {
        self.on_read(-1);
    }

    /// Deliver everything pending to every listener now
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let current = state.current_line_index;
        for notifier in &mut state.notifiers {
            notifier.flush(current);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingListener;
    use super::*;
    use pretty_assertions::assert_eq;

    fn notifier(
        listener: &Arc<RecordingListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) -> ListenerNotifier {
        ListenerNotifier::new(StageKey::next(), listener.clone(), max_wait, max_line_count)
    }

    #[test]
    fn test_initial_reset() {
        let listener = RecordingListener::new();
        let _notifier = notifier(&listener, Duration::ZERO, 1);
        assert_eq!(listener.modifications(), vec![Modification::Reset]);
    }

    #[test]
    fn test_every_read_delivered_without_throttle() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::ZERO, 1);
        listener.take();

        notifier.on_read(1);
        notifier.on_read(2);
        assert_eq!(
            listener.modifications(),
            vec![Modification::appended(0, 1), Modification::appended(1, 1)]
        );
    }

    #[test]
    fn test_large_reads_are_chunked() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_secs(60), 1000);
        listener.take();

        notifier.on_read(2000);
        assert_eq!(
            listener.modifications(),
            vec![
                Modification::appended(0, 1000),
                Modification::appended(1000, 1000)
            ]
        );
    }

    #[test]
    fn test_small_reads_wait_for_max_wait() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_millis(50), 100);
        listener.take();

        notifier.on_read(9);
        assert!(listener.modifications().is_empty());

        std::thread::sleep(Duration::from_millis(100));
        notifier.on_read(9);
        assert_eq!(listener.modifications(), vec![Modification::appended(0, 9)]);
    }

    #[test]
    fn test_repeated_resets_are_collapsed() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_secs(60), 100);

        notifier.on_read(-1);
        notifier.on_read(1);
        notifier.on_read(-1);
        assert_eq!(listener.modifications(), vec![Modification::Reset]);
    }

    #[test]
    fn test_invalidate_is_clamped_to_delivered_rows() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_secs(60), 10);
        listener.take();

        notifier.on_read(10);
        notifier.on_read(12);
        notifier.invalidate(0, 12);
        assert_eq!(
            listener.modifications(),
            vec![
                Modification::appended(0, 10),
                Modification::invalidated(0, 10)
            ]
        );
        assert_eq!(notifier.last_number_of_lines(), 0);
    }

    #[test]
    fn test_invalidate_beyond_delivered_rows_is_ignored() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_millis(50), 100);
        listener.take();

        std::thread::sleep(Duration::from_millis(100));
        notifier.on_read(9);
        notifier.on_read(35);
        notifier.invalidate(10, 25);
        assert_eq!(listener.modifications(), vec![Modification::appended(0, 9)]);
        assert_eq!(notifier.last_number_of_lines(), 9);
    }

    #[test]
    fn test_flush_delivers_once() {
        let listener = RecordingListener::new();
        let mut notifier = notifier(&listener, Duration::from_secs(60), 100);
        listener.take();

        notifier.on_read(1);
        notifier.flush(1);
        notifier.flush(1);
        assert_eq!(listener.modifications(), vec![Modification::appended(0, 1)]);
    }

    #[test]
    fn test_collection_tracks_current_line() {
        let collection = LogSourceListenerCollection::new(StageKey::next());
        collection.on_read(1);
        assert_eq!(collection.current_line_index(), 1);
        collection.invalidate(0, 1);
        assert_eq!(collection.current_line_index(), 0);
        collection.reset();
        assert_eq!(collection.current_line_index(), -1);
    }

    #[test]
    fn test_collection_ignores_duplicate_listener() {
        let collection = LogSourceListenerCollection::new(StageKey::next());
        let listener = RecordingListener::new();
        collection.add_listener(listener.clone(), Duration::ZERO, 1);
        collection.add_listener(listener.clone(), Duration::ZERO, 1);
        assert_eq!(collection.len(), 1);

        collection.on_read(1);
        assert_eq!(
            listener.modifications(),
            vec![Modification::Reset, Modification::appended(0, 1)]
        );
    }

    #[test]
    fn test_collection_catches_up_new_listener() {
        let collection = LogSourceListenerCollection::new(StageKey::next());
        collection.on_read(5);

        let listener = RecordingListener::new();
        collection.add_listener(listener.clone(), Duration::ZERO, 100);
        assert_eq!(
            listener.modifications(),
            vec![Modification::Reset, Modification::appended(0, 5)]
        );
    }

    #[test]
    fn test_collection_flush() {
        let collection = LogSourceListenerCollection::new(StageKey::next());
        let listener = RecordingListener::new();
        collection.add_listener(listener.clone(), Duration::from_secs(60), 100);

        collection.on_read(1);
        assert_eq!(listener.modifications(), vec![Modification::Reset]);

        collection.flush();
        assert_eq!(
            listener.modifications(),
            vec![Modification::Reset, Modification::appended(0, 1)]
        );
    }

    #[test]
    fn test_collection_remove_and_clear() {
        let collection = LogSourceListenerCollection::new(StageKey::next());
        let first = RecordingListener::new();
        let second = RecordingListener::new();
        collection.add_listener(first.clone(), Duration::ZERO, 1);
        collection.add_listener(second.clone(), Duration::ZERO, 1);

        let first: Arc<dyn LogSourceListener> = first;
        assert!(collection.remove_listener(&first));
        assert!(!collection.remove_listener(&first));
        assert_eq!(collection.len(), 1);

        collection.clear();
        assert!(collection.is_empty());
        collection.on_read(3);
        assert_eq!(second.modifications(), vec![Modification::Reset]);
    }
}
