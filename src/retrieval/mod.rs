//! Feed retrieval: the persisted cursor, fetch modules and the scheduler that
//! walks the feed list one chunk at a time.

pub mod cursor;
pub mod events;
pub mod feeds;
pub mod ingest;
pub mod module;
pub mod nonce;
pub mod scheduler;
pub mod status;

pub use self::cursor::{Cursor, CursorStore};
pub use self::events::RetrievalEvent;
pub use self::feeds::{add_feed, feed_list, Feed, NewFeed};
pub use self::ingest::IngestOutcome;
pub use self::module::{FeedItemPayload, FetchModule, ModuleRegistry};
pub use self::scheduler::{AdvanceOutcome, Scheduler, StepOutcome, TickOutcome};
pub use self::status::StatusReport;
