use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::RecordId;

const EVENT_CAPACITY: usize = 256;

/// Notifications emitted while stepping through the feed list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RetrievalEvent {
    ItemsIngested {
        feed_id: RecordId,
        new_items: usize,
    },
    FeedError {
        feed_id: RecordId,
        error_count: u64,
        message: String,
    },
    CycleComplete,
    CursorRepaired {
        reason: String,
    },
}

pub fn channel() -> (broadcast::Sender<RetrievalEvent>, broadcast::Receiver<RetrievalEvent>) {
    broadcast::channel(EVENT_CAPACITY)
}
