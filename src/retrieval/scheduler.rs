//! Steps through the feed list one feed at a time, persisting progress in the
//! cursor so that any later request can pick up where the last one stopped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::cursor::{CursorField, CursorStore, StallWatchdog};
use super::events::{self, RetrievalEvent};
use super::feeds::{as_count, feed_list, load_feed_by_id, Feed};
use super::ingest::{ingest_items, IngestOutcome};
use super::module::{FetchModule, ModuleRegistry};
use super::nonce::ChunkToken;
use super::status::{CycleCounter, Heartbeat, StatusReport, StatusStore, BuildInfo};
use crate::config::{RetrievalConfig, DEFAULT_INTERVAL_MINUTES};
use crate::error::{FetchError, RetrievalError, StoreError};
use crate::metas::{fields, MetaAccess};
use crate::store::{Ports, RecordId};
use crate::TARGET_RETRIEVAL;

const SELF_TRIGGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one chunk of retrieval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A feed returned items, new or already stored. `wrapped` is set when it was the last feed.
    Fetched {
        feed_id: RecordId,
        new_items: usize,
        wrapped: bool,
    },
    /// The remaining feeds yielded nothing; the cursor is idle again.
    CycleComplete,
    /// Another request holds the fetch flag.
    Busy,
    NoFeeds,
    /// The cursor pointed past the feed list and was reset.
    Corrupted,
    /// The chunk visited its maximum number of feeds without one returning items.
    StepCapReached,
    Failed {
        reason: String,
    },
}

impl StepOutcome {
    /// Whether the cycle is still running and the next chunk should follow.
    pub fn continues_cycle(&self) -> bool {
        matches!(self, StepOutcome::Fetched { wrapped: false, .. } | StepOutcome::StepCapReached)
    }
}

/// Result of a timer tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The cursor was idle and a new cycle began.
    Began { step: StepOutcome },
    /// A cycle is running and the watchdog's retrigger time has not come.
    AlreadyRetrieving,
    /// A cycle is running; a watchdog snapshot was taken for the next tick.
    WatchdogArmed,
    /// The cursor had not moved since the snapshot; it was freed and a chunk ran.
    Unstuck { step: StepOutcome },
    /// The watchdog outlived the stale window; the cursor was reset.
    StaleReset,
    /// The cursor moved since the snapshot; the snapshot was refreshed.
    ProgressObserved,
    Failed { reason: String },
}

impl TickOutcome {
    pub fn step(&self) -> Option<&StepOutcome> {
        match self {
            TickOutcome::Began { step } | TickOutcome::Unstuck { step } => Some(step),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// No cycle is active.
    Inactive,
    /// The next chunk was requested over HTTP.
    Requested,
    /// Chunks ran in-process until the cycle stopped.
    Continued { chunks: usize },
    Failed { reason: String },
}

enum FetchResult {
    Ingested(IngestOutcome),
    Empty,
    Failed,
    NoModule,
}

pub struct Scheduler {
    config: RetrievalConfig,
    access: Arc<MetaAccess>,
    cursor: CursorStore,
    status: StatusStore,
    tokens: ChunkToken,
    modules: ModuleRegistry,
    events: broadcast::Sender<RetrievalEvent>,
}

impl Scheduler {
    pub fn new(config: RetrievalConfig, ports: Ports, modules: ModuleRegistry) -> Self {
        let (events, _) = events::channel();
        Self {
            config,
            cursor: CursorStore::new(ports.options.clone()),
            status: StatusStore::new(ports.options.clone()),
            tokens: ChunkToken::new(ports.options.clone()),
            access: Arc::new(MetaAccess::new(ports)),
            modules,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetrievalEvent> {
        self.events.subscribe()
    }

    pub fn metas(&self) -> &Arc<MetaAccess> {
        &self.access
    }

    pub fn tokens(&self) -> &ChunkToken {
        &self.tokens
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    fn emit(&self, event: RetrievalEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Runs one chunk: finds the next feed that yields new items and ingests them.
    pub async fn step_through_feedlist(&self) -> StepOutcome {
        match self.step(Utc::now()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target: TARGET_RETRIEVAL, "Retrieval step failed: {}", err);
                StepOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn step(&self, now: DateTime<Utc>) -> Result<StepOutcome, StoreError> {
        self.status.bump(CycleCounter::ChunksBegun).await?;
        let mut cursor = self.cursor.load().await?;

        if cursor.fetch_in_progress {
            info!(target: TARGET_RETRIEVAL, "A feed is already being fetched; not starting another");
            return Ok(StepOutcome::Busy);
        }

        let feeds = feed_list(&self.access, &self.config.excluded_feed_kinds).await?;
        if feeds.is_empty() {
            info!(target: TARGET_RETRIEVAL, "No published feeds to retrieve");
            self.cursor.reset_to_idle().await?;
            return Ok(StepOutcome::NoFeeds);
        }
        let last_index = feeds.len() - 1;
        debug!(target: TARGET_RETRIEVAL, "Feed list has {} feeds; last index {}", feeds.len(), last_index);

        self.cursor.save(&[CursorField::ChunkReady(false)]).await?;

        for _ in 0..self.config.step_cap(feeds.len()) {
            let mut index = cursor.iteration_index;

            if cursor.previous_iteration_index == index && index != 0 {
                warn!(target: TARGET_RETRIEVAL, "Iteration index {} did not advance; forcing it forward", index);
                index += 1;
                self.cursor.save(&[CursorField::IterationIndex(index)]).await?;
                self.emit(RetrievalEvent::CursorRepaired {
                    reason: format!("stuck iteration index {}", index - 1),
                });
            }

            if index > last_index {
                warn!(target: TARGET_RETRIEVAL, "Iteration index {} is past the last feed {}; resetting", index, last_index);
                self.cursor.reset_to_idle().await?;
                self.emit(RetrievalEvent::CursorRepaired {
                    reason: format!("iteration index {} beyond feed list", index),
                });
                return Ok(StepOutcome::Corrupted);
            }

            let feed = &feeds[index];
            debug!(target: TARGET_RETRIEVAL, "Retrieving feed {} ({}) at index {}", feed.id, feed.url, index);
            self.access
                .write(feed.id, fields::FEED_LAST_CHECKED, json!(now.to_rfc3339()))
                .await?;
            self.status
                .write_heartbeat(&Heartbeat {
                    feed_id: feed.id,
                    feed_title: feed.title.clone(),
                    last_key: last_index,
                    feeds_iteration: index,
                    total_feeds: feeds.len(),
                })
                .await?;

            let wrapped = index == last_index;
            if wrapped {
                debug!(target: TARGET_RETRIEVAL, "Feed {} is the last in the list; wrapping", feed.id);
                self.cursor.save(&[CursorField::IterationIndex(0)]).await?;
                cursor.iteration_index = 0;
            } else {
                self.cursor
                    .save(&[
                        CursorField::PreviousIterationIndex(index),
                        CursorField::IterationIndex(index + 1),
                        CursorField::IterationActive(true),
                    ])
                    .await?;
                cursor.previous_iteration_index = index;
                cursor.iteration_index = index + 1;
            }

            let fetched = self.fetch_feed(feed, now).await?;
            if wrapped {
                self.cursor.save(&[CursorField::IterationActive(false)]).await?;
            }

            if let FetchResult::Ingested(outcome) = &fetched {
                self.cursor.save(&[CursorField::ChunkReady(true)]).await?;
                if wrapped {
                    self.finish_cycle().await?;
                }
                return Ok(StepOutcome::Fetched {
                    feed_id: feed.id,
                    new_items: outcome.new_items,
                    wrapped,
                });
            }

            if wrapped {
                info!(target: TARGET_RETRIEVAL, "Last feed yielded nothing; cycle complete");
                self.cursor.reset_to_idle().await?;
                self.finish_cycle().await?;
                return Ok(StepOutcome::CycleComplete);
            }

            debug!(target: TARGET_RETRIEVAL, "Feed {} yielded nothing; moving to the next feed", feed.id);
        }

        warn!(target: TARGET_RETRIEVAL, "Chunk reached its step cap without a fetched feed");
        self.cursor.save(&[CursorField::ChunkReady(true)]).await?;
        Ok(StepOutcome::StepCapReached)
    }

    async fn finish_cycle(&self) -> Result<(), StoreError> {
        self.status.bump(CycleCounter::CyclesEnded).await?;
        self.emit(RetrievalEvent::CycleComplete);
        Ok(())
    }

    /// Runs the feed's module with the fetch flag held, then ingests.
    async fn fetch_feed(&self, feed: &Feed, now: DateTime<Utc>) -> Result<FetchResult, StoreError> {
        let Some(module) = self.modules.resolve(&feed.kind) else {
            warn!(target: TARGET_RETRIEVAL, "No fetch module for kind {} of feed {}; skipping", feed.kind, feed.id);
            return Ok(FetchResult::NoModule);
        };

        let fetched = self.fetch_flagged(module.as_ref(), feed).await?;
        let empty = matches!(&fetched, Ok(items) if items.is_empty());

        Ok(match self.record_fetch(feed, fetched, now).await? {
            Ok(_) if empty => FetchResult::Empty,
            Ok(outcome) => FetchResult::Ingested(outcome),
            Err(_) => FetchResult::Failed,
        })
    }

    /// Calls the module with `fetch_in_progress` set for the duration.
    async fn fetch_flagged(
        &self,
        module: &dyn FetchModule,
        feed: &Feed,
    ) -> Result<Result<Vec<super::module::FeedItemPayload>, FetchError>, StoreError> {
        self.cursor.save(&[CursorField::FetchInProgress(true)]).await?;
        let fetched = module.fetch(feed).await;
        self.cursor.save(&[CursorField::FetchInProgress(false)]).await?;
        Ok(fetched)
    }

    /// Ingests a successful fetch or counts a failed one against the feed.
    async fn record_fetch(
        &self,
        feed: &Feed,
        fetched: Result<Vec<super::module::FeedItemPayload>, FetchError>,
        now: DateTime<Utc>,
    ) -> Result<Result<IngestOutcome, FetchError>, StoreError> {
        match fetched {
            Ok(items) => {
                let outcome = ingest_items(&self.access, feed, items, now).await?;
                if feed.error_count > 0 {
                    self.access.write(feed.id, fields::FEED_ERROR_COUNT, json!(0)).await?;
                }
                self.access
                    .write(feed.id, fields::FEED_LAST_RETRIEVED, json!(now.to_rfc3339()))
                    .await?;
                info!(
                    target: TARGET_RETRIEVAL,
                    "Feed {} yielded {} new items ({} repeats)",
                    feed.id,
                    outcome.new_items,
                    outcome.repeats
                );
                if outcome.new_items > 0 {
                    self.emit(RetrievalEvent::ItemsIngested {
                        feed_id: feed.id,
                        new_items: outcome.new_items,
                    });
                }
                Ok(Ok(outcome))
            }
            Err(err) => {
                let error_count = self
                    .access
                    .read(feed.id, fields::FEED_ERROR_COUNT)
                    .await?
                    .as_ref()
                    .and_then(as_count)
                    .unwrap_or(0)
                    + 1;
                self.access
                    .write(feed.id, fields::FEED_ERROR_COUNT, json!(error_count))
                    .await?;
                warn!(target: TARGET_RETRIEVAL, "Feed {} failed ({} errors): {}", feed.id, error_count, err);
                self.emit(RetrievalEvent::FeedError {
                    feed_id: feed.id,
                    error_count,
                    message: err.to_string(),
                });
                Ok(Err(err))
            }
        }
    }

    /// Timer entry point: begins a cycle from idle, otherwise runs the stall watchdog.
    pub async fn trigger_source_data(&self) -> TickOutcome {
        self.trigger_source_data_at(Utc::now()).await
    }

    pub async fn trigger_source_data_at(&self, now: DateTime<Utc>) -> TickOutcome {
        match self.trigger(now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target: TARGET_RETRIEVAL, "Retrieval trigger failed: {}", err);
                TickOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn trigger(&self, now: DateTime<Utc>) -> Result<TickOutcome, StoreError> {
        let cursor = self.cursor.load().await?;
        debug!(
            target: TARGET_RETRIEVAL,
            "Tick: fetching={} iteration={} active={} chunk_ready={}",
            cursor.fetch_in_progress,
            cursor.iteration_index,
            cursor.iteration_active,
            cursor.chunk_ready
        );

        if cursor.is_idle() {
            info!(target: TARGET_RETRIEVAL, "Beginning the retrieval process");
            self.cursor.save(&[CursorField::IterationActive(true)]).await?;
            self.status.bump(CycleCounter::CyclesBegun).await?;
            let step = self.step(now).await?;
            return Ok(TickOutcome::Began { step });
        }

        let Some(watchdog) = cursor.stall_watchdog else {
            info!(target: TARGET_RETRIEVAL, "Retrieval in progress; taking a watchdog snapshot");
            self.cursor
                .save(&[CursorField::StallWatchdog(Some(StallWatchdog {
                    snapshot: cursor.snapshot(),
                    created_at: now,
                    retrigger_at: now + self.config.retrigger_window,
                }))])
                .await?;
            return Ok(TickOutcome::WatchdogArmed);
        };

        if watchdog.retrigger_at > now {
            info!(target: TARGET_RETRIEVAL, "The sources are already being retrieved");
            return Ok(TickOutcome::AlreadyRetrieving);
        }

        if watchdog.snapshot == cursor.snapshot() {
            warn!(
                target: TARGET_RETRIEVAL,
                "Cursor unchanged since {}; clearing flags and resuming at {}",
                watchdog.created_at,
                cursor.iteration_index
            );
            self.cursor
                .save(&[
                    CursorField::StallWatchdog(None),
                    CursorField::FetchInProgress(false),
                    CursorField::ChunkReady(true),
                    CursorField::IterationActive(true),
                ])
                .await?;
            self.emit(RetrievalEvent::CursorRepaired {
                reason: "stalled cursor".to_string(),
            });
            let step = self.step(now).await?;
            return Ok(TickOutcome::Unstuck { step });
        }

        if now - watchdog.created_at > self.config.stale_window {
            warn!(target: TARGET_RETRIEVAL, "Watchdog from {} is stale; resetting retrieval", watchdog.created_at);
            self.cursor.reset_to_idle().await?;
            self.emit(RetrievalEvent::CursorRepaired {
                reason: "stale watchdog".to_string(),
            });
            return Ok(TickOutcome::StaleReset);
        }

        info!(target: TARGET_RETRIEVAL, "Cursor moved since the last snapshot; watching again");
        self.cursor
            .save(&[CursorField::StallWatchdog(Some(StallWatchdog {
                snapshot: cursor.snapshot(),
                created_at: watchdog.created_at,
                retrigger_at: now + self.config.retrigger_window,
            }))])
            .await?;
        Ok(TickOutcome::ProgressObserved)
    }

    /// A full tick: the trigger, followed by the rest of the cycle when a chunk ran.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        let outcome = self.trigger_source_data().await;
        if outcome.step().is_some_and(StepOutcome::continues_cycle) {
            self.advance_feeds().await;
        }
        outcome
    }

    /// Requests the next chunk of an active cycle, over HTTP when a self-trigger
    /// URL is configured and in-process otherwise.
    pub async fn advance_feeds(self: &Arc<Self>) -> AdvanceOutcome {
        match self.advance().await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(target: TARGET_RETRIEVAL, "Could not advance retrieval: {}", err);
                AdvanceOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn advance(self: &Arc<Self>) -> Result<AdvanceOutcome, RetrievalError> {
        let cursor = self.cursor.load().await?;
        if !cursor.iteration_active || cursor.fetch_in_progress {
            debug!(target: TARGET_RETRIEVAL, "No active cycle to advance");
            return Ok(AdvanceOutcome::Inactive);
        }

        if let Some(base) = &self.config.self_trigger_url {
            let nonce = self.tokens.issue().await?;
            let url = format!("{}/?press=forward&nonce={}", base, nonce);
            tokio::spawn(async move {
                let client = match reqwest::Client::builder().timeout(SELF_TRIGGER_TIMEOUT).build() {
                    Ok(client) => client,
                    Err(err) => {
                        error!(target: TARGET_RETRIEVAL, "Failed to build self-trigger client: {}", err);
                        return;
                    }
                };
                if let Err(err) = client.get(&url).send().await {
                    warn!(target: TARGET_RETRIEVAL, "Self-trigger request failed: {}", err);
                }
            });
            debug!(target: TARGET_RETRIEVAL, "Requested the next chunk over HTTP");
            return Ok(AdvanceOutcome::Requested);
        }

        // Every continuing chunk moves the index forward, so one pass over the
        // list bounds the loop.
        let limit = self.access.ports().records.published_feeds().await?.len() + 1;
        let mut chunks = 0;
        while chunks < limit {
            let step = self.step_through_feedlist().await;
            chunks += 1;
            if !step.continues_cycle() {
                break;
            }
        }
        debug!(target: TARGET_RETRIEVAL, "Ran {} chunks in-process", chunks);
        Ok(AdvanceOutcome::Continued { chunks })
    }

    /// Runs one chunk on behalf of a request that presented a chunk token.
    pub async fn step_with_token(self: &Arc<Self>, nonce: &str) -> Result<Option<StepOutcome>, StoreError> {
        if !self.tokens.consume(nonce).await? {
            return Ok(None);
        }
        let step = self.step_through_feedlist().await;
        if step.continues_cycle() {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.advance_feeds().await;
            });
        }
        Ok(Some(step))
    }

    /// Admin reset of every cursor flag.
    pub async fn feed_retrieval_reset(&self) -> Result<(), StoreError> {
        info!(target: TARGET_RETRIEVAL, "Retrieval reset requested");
        self.cursor.reset_to_idle().await?;
        self.emit(RetrievalEvent::CursorRepaired {
            reason: "admin reset".to_string(),
        });
        Ok(())
    }

    /// Fetches one feed outside the cycle. The iteration index is left alone.
    pub async fn retrieve_feed(&self, feed_id: RecordId) -> Result<IngestOutcome, RetrievalError> {
        let feed = load_feed_by_id(&self.access, feed_id).await?;
        let module = self.module_for(&feed)?;

        info!(target: TARGET_RETRIEVAL, "Retrieving feed {} on request", feed.id);
        let fetched = self.fetch_flagged(module.as_ref(), &feed).await?;
        let outcome = self.record_fetch(&feed, fetched, Utc::now()).await??;

        let cursor = self.cursor.load().await?;
        if !cursor.iteration_active {
            self.cursor
                .save(&[
                    CursorField::FetchInProgress(false),
                    CursorField::ChunkReady(true),
                    CursorField::StallWatchdog(None),
                ])
                .await?;
        }
        Ok(outcome)
    }

    /// Whether the feed's module can read it. Nothing is stored.
    pub async fn is_feed(&self, feed_id: RecordId) -> Result<bool, RetrievalError> {
        let feed = load_feed_by_id(&self.access, feed_id).await?;
        let module = self.module_for(&feed)?;
        match module.fetch(&feed).await {
            Ok(_) => Ok(true),
            Err(err) => {
                debug!(target: TARGET_RETRIEVAL, "Feed {} did not check out: {}", feed.id, err);
                Ok(false)
            }
        }
    }

    fn module_for(&self, feed: &Feed) -> Result<Arc<dyn FetchModule>, RetrievalError> {
        self.modules
            .resolve(&feed.kind)
            .ok_or_else(|| RetrievalError::NoModule(feed.kind.clone()))
    }

    pub async fn status(&self) -> Result<StatusReport, StoreError> {
        Ok(StatusReport {
            cursor: self.cursor.load().await?,
            heartbeat: self.status.heartbeat().await?,
            cycle_stats: self.status.cycle_stats().await?,
            interval_minutes: self.interval_minutes().await?,
            build: BuildInfo::current(),
        })
    }

    pub async fn interval_minutes(&self) -> Result<u64, StoreError> {
        self.status.interval_minutes(self.config.interval_minutes).await
    }

    /// Time between timer ticks, read fresh from storage on every call.
    pub async fn tick_period(&self) -> Duration {
        let minutes = self.interval_minutes().await.unwrap_or_else(|err| {
            warn!(target: TARGET_RETRIEVAL, "Could not read retrieval frequency: {}", err);
            DEFAULT_INTERVAL_MINUTES
        });
        Duration::from_secs(minutes * 60)
    }

    pub async fn reset_cycle_stats(&self) -> Result<(), StoreError> {
        self.status.reset_cycle_stats(Utc::now()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::retrieval::cursor::Cursor;
    use crate::retrieval::feeds::{add_feed, NewFeed};
    use crate::retrieval::module::FeedItemPayload;
    use crate::retrieval::status::OPTION_RETRIEVAL_FREQUENCY;
    use crate::store::OptionStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Fresh,
        Repeat,
        Empty,
        Fail,
    }

    /// Returns a never-seen item per call unless told otherwise.
    #[derive(Default)]
    struct Scripted {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FetchModule for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn matches(&self, feed_kind: &str) -> bool {
            feed_kind == "rss"
        }

        async fn fetch(&self, feed: &Feed) -> Result<Vec<FeedItemPayload>, FetchError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(feed.url.clone());
                calls.len()
            };
            match self.behaviors.get(&feed.url).copied().unwrap_or(Behavior::Fresh) {
                Behavior::Fresh => Ok(vec![FeedItemPayload {
                    guid: Some(format!("{}#{}", feed.url, call)),
                    title: format!("Item {}", call),
                    link: format!("{}/item/{}", feed.url, call),
                    content: "some words here".to_string(),
                    parent_feed_id: feed.id,
                    ..FeedItemPayload::default()
                }]),
                Behavior::Repeat => Ok(vec![FeedItemPayload {
                    guid: Some(format!("{}#same", feed.url)),
                    title: "Same item".to_string(),
                    link: format!("{}/item/same", feed.url),
                    parent_feed_id: feed.id,
                    ..FeedItemPayload::default()
                }]),
                Behavior::Empty => Ok(Vec::new()),
                Behavior::Fail => Err(FetchError::Offline(format!("{} is down", feed.url))),
            }
        }
    }

    struct Harness {
        db: Arc<Database>,
        scheduler: Arc<Scheduler>,
        module: Arc<Scripted>,
        feeds: Vec<RecordId>,
    }

    impl Harness {
        async fn cursor(&self) -> Cursor {
            CursorStore::new(self.db.clone()).load().await.unwrap()
        }

        async fn set(&self, fields: &[CursorField]) {
            CursorStore::new(self.db.clone()).save(fields).await.unwrap();
        }

        async fn error_count(&self, feed: RecordId) -> u64 {
            self.scheduler
                .metas()
                .read(feed, fields::FEED_ERROR_COUNT)
                .await
                .unwrap()
                .as_ref()
                .and_then(as_count)
                .unwrap_or(0)
        }
    }

    fn url(name: &str) -> String {
        format!("https://{}.test/feed", name)
    }

    async fn harness(names: &[&str], behaviors: &[(&str, Behavior)], config: RetrievalConfig) -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let module = Arc::new(Scripted {
            behaviors: behaviors.iter().map(|(n, b)| (url(n), *b)).collect(),
            ..Scripted::default()
        });
        let modules = ModuleRegistry::new().with_module(module.clone());
        let scheduler = Arc::new(Scheduler::new(config, Ports::from_backend(db.clone()), modules));

        let mut feeds = Vec::new();
        for name in names {
            let kind = if name.starts_with("opml") { "opml" } else { "rss" };
            let id = add_feed(
                scheduler.metas(),
                NewFeed {
                    url: url(name),
                    title: name.to_string(),
                    kind: Some(kind.to_string()),
                    ..NewFeed::default()
                },
            )
            .await
            .unwrap();
            feeds.push(id);
        }

        Harness {
            db,
            scheduler,
            module,
            feeds,
        }
    }

    #[tokio::test]
    async fn test_feed_returning_only_repeats_ends_the_chunk() {
        let h = harness(
            &["a", "b", "c"],
            &[("a", Behavior::Repeat), ("b", Behavior::Repeat), ("c", Behavior::Repeat)],
            RetrievalConfig::default(),
        )
        .await;
        for _ in 0..3 {
            h.scheduler.step_through_feedlist().await;
        }
        assert!(h.cursor().await.is_idle());

        let tick = h.scheduler.trigger_source_data().await;
        assert_eq!(
            tick,
            TickOutcome::Began {
                step: StepOutcome::Fetched {
                    feed_id: h.feeds[0],
                    new_items: 0,
                    wrapped: false
                }
            }
        );
        assert_eq!(h.module.calls(), vec![url("a"), url("b"), url("c"), url("a")]);
        let cursor = h.cursor().await;
        assert_eq!((cursor.previous_iteration_index, cursor.iteration_index), (0, 1));
        assert!(cursor.iteration_active);
    }

    #[tokio::test]
    async fn test_three_feed_cycle() {
        let h = harness(&["a", "b", "c"], &[], RetrievalConfig::default()).await;

        let first = h.scheduler.step_through_feedlist().await;
        assert!(matches!(first, StepOutcome::Fetched { wrapped: false, .. }));
        let cursor = h.cursor().await;
        assert_eq!((cursor.previous_iteration_index, cursor.iteration_index), (0, 1));
        assert!(cursor.iteration_active);
        assert!(!cursor.fetch_in_progress);

        h.scheduler.step_through_feedlist().await;
        let cursor = h.cursor().await;
        assert_eq!((cursor.previous_iteration_index, cursor.iteration_index), (1, 2));

        let third = h.scheduler.step_through_feedlist().await;
        assert_eq!(
            third,
            StepOutcome::Fetched {
                feed_id: h.feeds[2],
                new_items: 1,
                wrapped: true
            }
        );
        let cursor = h.cursor().await;
        assert_eq!(cursor.iteration_index, 0);
        assert!(!cursor.iteration_active);
        assert!(cursor.is_idle());

        let tick = h.scheduler.trigger_source_data().await;
        assert!(matches!(
            tick,
            TickOutcome::Began {
                step: StepOutcome::Fetched { .. }
            }
        ));
        assert_eq!(h.module.calls(), vec![url("a"), url("b"), url("c"), url("a")]);

        let stats = h.scheduler.status().await.unwrap().cycle_stats;
        assert_eq!(stats.retrieval_cycles_begun, 1);
        assert_eq!(stats.retrieval_cycles_ended, 1);
        assert_eq!(stats.retrieval_chunks_begun, 4);
    }

    #[tokio::test]
    async fn test_each_feed_visited_once_per_cycle() {
        let names = ["a", "b", "c", "d", "e"];
        let h = harness(&names, &[], RetrievalConfig::default()).await;

        loop {
            let step = h.scheduler.step_through_feedlist().await;
            if !step.continues_cycle() {
                break;
            }
        }

        let expected: Vec<String> = names.iter().map(|n| url(n)).collect();
        assert_eq!(h.module.calls(), expected);
        assert!(h.cursor().await.is_idle());
    }

    #[tokio::test]
    async fn test_stuck_index_is_forced_forward() {
        let h = harness(&["a", "b", "c", "d"], &[], RetrievalConfig::default()).await;
        h.set(&[
            CursorField::PreviousIterationIndex(1),
            CursorField::IterationIndex(1),
            CursorField::IterationActive(true),
        ])
        .await;

        h.scheduler.step_through_feedlist().await;

        assert_eq!(h.module.calls(), vec![url("c")]);
        let cursor = h.cursor().await;
        assert!(cursor.iteration_index > 1);
        assert_eq!(cursor.previous_iteration_index, 2);
    }

    #[tokio::test]
    async fn test_index_past_the_end_resets_without_fetching() {
        let h = harness(&["a", "b", "c"], &[], RetrievalConfig::default()).await;
        h.set(&[
            CursorField::IterationIndex(7),
            CursorField::PreviousIterationIndex(6),
            CursorField::IterationActive(true),
        ])
        .await;
        let mut events = h.scheduler.subscribe();

        assert_eq!(h.scheduler.step_through_feedlist().await, StepOutcome::Corrupted);
        assert!(h.module.calls().is_empty());
        assert_eq!(h.cursor().await, Cursor::default());
        assert!(matches!(
            events.try_recv(),
            Ok(RetrievalEvent::CursorRepaired { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_feed_moves_on_within_the_chunk() {
        let h = harness(&["a", "b", "c"], &[("a", Behavior::Empty)], RetrievalConfig::default()).await;

        let step = h.scheduler.step_through_feedlist().await;
        assert_eq!(
            step,
            StepOutcome::Fetched {
                feed_id: h.feeds[1],
                new_items: 1,
                wrapped: false
            }
        );
        assert_eq!(h.module.calls(), vec![url("a"), url("b")]);
        let cursor = h.cursor().await;
        assert_eq!((cursor.previous_iteration_index, cursor.iteration_index), (1, 2));
        assert!(cursor.chunk_ready);
    }

    #[tokio::test]
    async fn test_all_empty_completes_the_cycle() {
        let h = harness(
            &["a", "b"],
            &[("a", Behavior::Empty), ("b", Behavior::Empty)],
            RetrievalConfig::default(),
        )
        .await;
        let mut events = h.scheduler.subscribe();

        assert_eq!(h.scheduler.step_through_feedlist().await, StepOutcome::CycleComplete);
        assert_eq!(h.cursor().await, Cursor::default());
        assert_eq!(events.try_recv().unwrap(), RetrievalEvent::CycleComplete);
    }

    #[tokio::test]
    async fn test_failed_fetch_counts_errors_and_continues() {
        let h = harness(&["a", "b"], &[("a", Behavior::Fail)], RetrievalConfig::default()).await;
        let mut events = h.scheduler.subscribe();

        let step = h.scheduler.step_through_feedlist().await;
        assert!(matches!(step, StepOutcome::Fetched { wrapped: true, .. }));
        assert_eq!(h.error_count(h.feeds[0]).await, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            RetrievalEvent::FeedError {
                feed_id: h.feeds[0],
                error_count: 1,
                message: format!("feed endpoint is offline: {} is down", url("a")),
            }
        );

        h.scheduler.step_through_feedlist().await;
        assert_eq!(h.error_count(h.feeds[0]).await, 2);
        assert_eq!(h.error_count(h.feeds[1]).await, 0);
    }

    #[tokio::test]
    async fn test_feed_without_module_is_skipped() {
        let h = harness(&["opml-a", "b"], &[], RetrievalConfig::default()).await;

        let step = h.scheduler.step_through_feedlist().await;
        assert_eq!(
            step,
            StepOutcome::Fetched {
                feed_id: h.feeds[1],
                new_items: 1,
                wrapped: true
            }
        );
        assert_eq!(h.module.calls(), vec![url("b")]);
    }

    #[tokio::test]
    async fn test_busy_cursor_is_left_alone() {
        let h = harness(&["a"], &[], RetrievalConfig::default()).await;
        h.set(&[CursorField::FetchInProgress(true)]).await;

        assert_eq!(h.scheduler.step_through_feedlist().await, StepOutcome::Busy);
        assert!(h.module.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_feeds() {
        let h = harness(&[], &[], RetrievalConfig::default()).await;
        assert_eq!(h.scheduler.step_through_feedlist().await, StepOutcome::NoFeeds);
    }

    #[tokio::test]
    async fn test_step_cap_bounds_a_chunk() {
        let config = RetrievalConfig {
            max_steps_per_chunk: 2,
            ..RetrievalConfig::default()
        };
        let h = harness(
            &["a", "b", "c", "d"],
            &[("a", Behavior::Empty), ("b", Behavior::Empty), ("c", Behavior::Empty)],
            config,
        )
        .await;

        assert_eq!(h.scheduler.step_through_feedlist().await, StepOutcome::StepCapReached);
        assert_eq!(h.module.calls().len(), 2);
        let cursor = h.cursor().await;
        assert_eq!(cursor.iteration_index, 2);
        assert!(cursor.chunk_ready);
    }

    #[tokio::test]
    async fn test_watchdog_frees_a_stalled_cursor() {
        let h = harness(&["a", "b", "c"], &[], RetrievalConfig::default()).await;
        h.set(&[
            CursorField::PreviousIterationIndex(0),
            CursorField::IterationIndex(1),
            CursorField::IterationActive(true),
            CursorField::FetchInProgress(true),
        ])
        .await;
        let t0 = Utc::now();

        assert_eq!(h.scheduler.trigger_source_data_at(t0).await, TickOutcome::WatchdogArmed);
        assert_eq!(
            h.scheduler.trigger_source_data_at(t0 + chrono::Duration::hours(1)).await,
            TickOutcome::AlreadyRetrieving
        );

        let tick = h
            .scheduler
            .trigger_source_data_at(t0 + chrono::Duration::hours(3))
            .await;
        assert_eq!(
            tick,
            TickOutcome::Unstuck {
                step: StepOutcome::Fetched {
                    feed_id: h.feeds[1],
                    new_items: 1,
                    wrapped: false
                }
            }
        );
        let cursor = h.cursor().await;
        assert!(cursor.stall_watchdog.is_none());
        assert!(!cursor.fetch_in_progress);
        assert_eq!(cursor.iteration_index, 2);
    }

    #[tokio::test]
    async fn test_stale_watchdog_resets_the_cursor() {
        let h = harness(&["a", "b", "c"], &[], RetrievalConfig::default()).await;
        h.set(&[CursorField::IterationIndex(1), CursorField::IterationActive(true)]).await;
        let t0 = Utc::now();

        assert_eq!(h.scheduler.trigger_source_data_at(t0).await, TickOutcome::WatchdogArmed);

        h.set(&[CursorField::IterationIndex(2)]).await;
        assert_eq!(
            h.scheduler.trigger_source_data_at(t0 + chrono::Duration::hours(3)).await,
            TickOutcome::ProgressObserved
        );

        h.set(&[CursorField::IterationIndex(1)]).await;
        assert_eq!(
            h.scheduler.trigger_source_data_at(t0 + chrono::Duration::hours(25)).await,
            TickOutcome::StaleReset
        );
        assert_eq!(h.cursor().await, Cursor::default());
        assert!(h.module.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tick_runs_the_whole_cycle_in_process() {
        let h = harness(&["a", "b", "c"], &[], RetrievalConfig::default()).await;

        let tick = h.scheduler.tick().await;
        assert!(matches!(tick, TickOutcome::Began { .. }));
        assert_eq!(h.module.calls(), vec![url("a"), url("b"), url("c")]);
        assert!(h.cursor().await.is_idle());
        assert_eq!(h.scheduler.advance_feeds().await, AdvanceOutcome::Inactive);
    }

    #[tokio::test]
    async fn test_step_with_token_requires_a_valid_token() {
        let h = harness(&["a"], &[], RetrievalConfig::default()).await;

        assert_eq!(h.scheduler.step_with_token("forged").await.unwrap(), None);
        assert!(h.module.calls().is_empty());

        let nonce = h.scheduler.tokens().issue().await.unwrap();
        let step = h.scheduler.step_with_token(&nonce).await.unwrap();
        assert!(matches!(step, Some(StepOutcome::Fetched { .. })));
        assert_eq!(h.scheduler.step_with_token(&nonce).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retrieve_single_feed_leaves_the_index() {
        let h = harness(&["a", "b"], &[("b", Behavior::Fail)], RetrievalConfig::default()).await;

        let outcome = h.scheduler.retrieve_feed(h.feeds[0]).await.unwrap();
        assert_eq!(outcome.new_items, 1);
        assert_eq!(h.cursor().await, Cursor::default());

        assert!(matches!(
            h.scheduler.retrieve_feed(h.feeds[1]).await,
            Err(RetrievalError::Fetch(FetchError::Offline(_)))
        ));
        assert_eq!(h.error_count(h.feeds[1]).await, 1);

        assert!(h.scheduler.is_feed(h.feeds[0]).await.unwrap());
        assert!(!h.scheduler.is_feed(h.feeds[1]).await.unwrap());
    }

    /// Records the fetch flag as seen from inside the module call.
    struct FlagWatcher {
        cursor: CursorStore,
        seen: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl FetchModule for FlagWatcher {
        fn name(&self) -> &str {
            "flag-watcher"
        }

        fn matches(&self, feed_kind: &str) -> bool {
            feed_kind == "rss"
        }

        async fn fetch(&self, _feed: &Feed) -> Result<Vec<FeedItemPayload>, FetchError> {
            let cursor = self
                .cursor
                .load()
                .await
                .map_err(|e| FetchError::Offline(e.to_string()))?;
            *self.seen.lock().unwrap() = Some(cursor.fetch_in_progress);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_retrieve_single_feed_holds_the_fetch_flag() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let watcher = Arc::new(FlagWatcher {
            cursor: CursorStore::new(db.clone()),
            seen: Mutex::new(None),
        });
        let scheduler = Scheduler::new(
            RetrievalConfig::default(),
            Ports::from_backend(db.clone()),
            ModuleRegistry::new().with_module(watcher.clone()),
        );
        let id = add_feed(
            scheduler.metas(),
            NewFeed {
                url: url("a"),
                title: "a".to_string(),
                kind: Some("rss".to_string()),
                ..NewFeed::default()
            },
        )
        .await
        .unwrap();

        scheduler.retrieve_feed(id).await.unwrap();
        assert_eq!(*watcher.seen.lock().unwrap(), Some(true));
        assert!(!CursorStore::new(db).load().await.unwrap().fetch_in_progress);
    }

    #[tokio::test]
    async fn test_tick_period_follows_the_stored_frequency() {
        let h = harness(&["a"], &[], RetrievalConfig::default()).await;
        assert_eq!(
            h.scheduler.tick_period().await,
            Duration::from_secs(DEFAULT_INTERVAL_MINUTES * 60)
        );

        h.db.update_option(OPTION_RETRIEVAL_FREQUENCY, &serde_json::json!(5))
            .await
            .unwrap();
        assert_eq!(h.scheduler.tick_period().await, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_admin_reset() {
        let h = harness(&["a", "b"], &[], RetrievalConfig::default()).await;
        h.set(&[
            CursorField::IterationIndex(1),
            CursorField::FetchInProgress(true),
            CursorField::ChunkReady(false),
        ])
        .await;

        h.scheduler.feed_retrieval_reset().await.unwrap();
        assert_eq!(h.cursor().await, Cursor::default());
    }
}
