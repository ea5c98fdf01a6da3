//! Periodic task scheduling
//!
//! Every stage registers exactly one periodic task. The task returns how long to wait before
//! it should run again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// One pass of a periodic task, returning the delay until the next pass
pub type PeriodicFn = Box<dyn FnMut() -> Duration + Send>;

/// Identifies a registered periodic task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Runs periodic tasks on behalf of log stages
pub trait TaskScheduler: Send + Sync {
    fn start_periodic(&self, name: &str, task: PeriodicFn) -> TaskHandle;

    /// Stop a task; returns false if it wasn't registered
    fn stop_periodic(&self, handle: TaskHandle) -> bool;
}

// ============================================================================
// Tokio
// ============================================================================

/// Schedules tasks on a tokio runtime; each pass runs on the blocking pool
pub struct TokioTaskScheduler {
    runtime: Handle,
    tasks: Mutex<HashMap<TaskHandle, CancellationToken>>,
}

impl TokioTaskScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduler for the runtime the caller is running on
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        Ok(Self::new(Handle::try_current()?))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TaskScheduler for TokioTaskScheduler {
    fn start_periodic(&self, name: &str, task: PeriodicFn) -> TaskHandle {
        let handle = TaskHandle::next();
        let cancel = CancellationToken::new();
        let task = Arc::new(Mutex::new(task));
        let name = name.to_string();

        {
            let cancel = cancel.clone();
            self.runtime.spawn(async move {
                loop {
                    let pass = Arc::clone(&task);
                    let delay = match tokio::task::spawn_blocking(move || {
                        let mut pass = pass.lock();
                        (*pass)()
                    })
                    .await
                    {
                        Ok(delay) => delay,
                        Err(err) => {
                            tracing::error!(task = %name, "Periodic task failed: {}", err);
                            break;
                        }
                    };

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                tracing::debug!(task = %name, "Periodic task stopped");
            });
        }

        self.tasks.lock().insert(handle, cancel);
        handle
    }

    fn stop_periodic(&self, handle: TaskHandle) -> bool {
        match self.tasks.lock().remove(&handle) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for TokioTaskScheduler {
    fn drop(&mut self) {
        for (_, cancel) in self.tasks.lock().drain() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Manual
// ============================================================================

struct ManualTask {
    handle: TaskHandle,
    name: String,
    task: Arc<Mutex<PeriodicFn>>,
}

/// Runs tasks only when asked to; delays are ignored
#[derive(Default)]
pub struct ManualTaskScheduler {
    tasks: Mutex<Vec<ManualTask>>,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Run every registered task once, in registration order
    pub fn run_once(&self) {
        // Tasks may register or stop tasks while running
        let snapshot: Vec<(TaskHandle, Arc<Mutex<PeriodicFn>>)> = self
            .tasks
            .lock()
            .iter()
            .map(|t| (t.handle, Arc::clone(&t.task)))
            .collect();

        for (handle, task) in snapshot {
            if !self.tasks.lock().iter().any(|t| t.handle == handle) {
                continue;
            }
            let mut task = task.lock();
            let _delay = (*task)();
        }
    }

    /// Run every registered task `passes` times
    pub fn run(&self, passes: usize) {
        for _ in 0..passes {
            self.run_once();
        }
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn start_periodic(&self, name: &str, task: PeriodicFn) -> TaskHandle {
        let handle = TaskHandle::next();
        self.tasks.lock().push(ManualTask {
            handle,
            name: name.to_string(),
            task: Arc::new(Mutex::new(task)),
        });
        handle
    }

    fn stop_periodic(&self, handle: TaskHandle) -> bool {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| t.handle != handle);
        tasks.len() != before
    }
}
