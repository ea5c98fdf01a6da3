//! Queue of upstream modifications waiting for the next pass

use std::sync::Arc;

use parking_lot::Mutex;
use tailpipe_types::Modification;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::listener::{LogSourceListener, StageKey};

/// The listener a stage registers upstream; it only enqueues
struct Enqueue {
    sender: UnboundedSender<(StageKey, Modification)>,
}

impl LogSourceListener for Enqueue {
    fn on_log_source_modified(&self, source: StageKey, modification: Modification) {
        // The receiving stage is gone once the send fails
        let _ = self.sender.send((source, modification));
    }
}

pub(crate) struct PendingModifications {
    listener: Arc<dyn LogSourceListener>,
    receiver: Mutex<UnboundedReceiver<(StageKey, Modification)>>,
}

impl PendingModifications {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            listener: Arc::new(Enqueue { sender }),
            receiver: Mutex::new(receiver),
        }
    }

    /// The listener to register with upstream sources
    pub(crate) fn listener(&self) -> Arc<dyn LogSourceListener> {
        Arc::clone(&self.listener)
    }

    /// Take everything queued so far, oldest first
    pub(crate) fn drain(&self) -> Vec<(StageKey, Modification)> {
        let mut receiver = self.receiver.lock();
        let mut drained = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            drained.push(item);
        }
        drained
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receiver.lock().is_empty()
    }
}
