//! State-change notifications.
//!
//! Delivery is best-effort. Nothing in the scheduler depends on an event
//! being received.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::id::{BuildKey, JobKey, WorkerId};
use crate::job::JobState;
use crate::project::BuildStatus;
use crate::worker::WorkerStatus;

/// Event emitted on every job, worker and build transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobChanged {
        job: JobKey,
        state: JobState,
    },
    BuildChanged {
        build: BuildKey,
        status: BuildStatus,
    },
    WorkerChanged {
        worker: WorkerId,
        status: WorkerStatus,
        reserved: bool,
    },
    SectionOpened {
        job: JobKey,
        section_id: i64,
        name: String,
    },
    SectionClosed {
        job: JobKey,
        section_id: i64,
    },
}

/// Fire-and-forget event sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Fans events out to every live subscriber over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Event>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
