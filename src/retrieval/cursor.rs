//! Persisted retrieval progress.
//!
//! Every field lives in its own option so an interrupted request leaves the rest
//! intact. Writes are read back and repaired once when the store did not take them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::OptionStore;
use crate::TARGET_RETRIEVAL;

pub const OPTION_ITERATION: &str = "pf_feeds_iteration";
pub const OPTION_PREV_ITERATION: &str = "pf_prev_iteration";
pub const OPTION_GO_SWITCH: &str = "pf_feeds_go_switch";
pub const OPTION_GOING_SWITCH: &str = "pf_iterate_going_switch";
pub const OPTION_READY_TO_CHUNK: &str = "pf_ready_to_chunk";
pub const OPTION_META_STATE: &str = "pf_feeds_meta_state";

/// The four flags the stall watchdog compares between ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub fetch_in_progress: bool,
    pub iteration_index: usize,
    pub iteration_active: bool,
    pub chunk_ready: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallWatchdog {
    pub snapshot: CursorSnapshot,
    pub created_at: DateTime<Utc>,
    pub retrigger_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub iteration_index: usize,
    pub previous_iteration_index: usize,
    pub fetch_in_progress: bool,
    pub iteration_active: bool,
    pub chunk_ready: bool,
    pub stall_watchdog: Option<StallWatchdog>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            iteration_index: 0,
            previous_iteration_index: 0,
            fetch_in_progress: false,
            iteration_active: false,
            chunk_ready: true,
            stall_watchdog: None,
        }
    }
}

impl Cursor {
    /// Nothing in flight and nothing started: a tick may begin a new cycle.
    pub fn is_idle(&self) -> bool {
        self.iteration_index == 0
            && !self.iteration_active
            && self.chunk_ready
            && !self.fetch_in_progress
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            fetch_in_progress: self.fetch_in_progress,
            iteration_index: self.iteration_index,
            iteration_active: self.iteration_active,
            chunk_ready: self.chunk_ready,
        }
    }
}

/// A single field update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorField {
    IterationIndex(usize),
    PreviousIterationIndex(usize),
    FetchInProgress(bool),
    IterationActive(bool),
    ChunkReady(bool),
    StallWatchdog(Option<StallWatchdog>),
}

impl CursorField {
    pub fn option_name(&self) -> &'static str {
        match self {
            CursorField::IterationIndex(_) => OPTION_ITERATION,
            CursorField::PreviousIterationIndex(_) => OPTION_PREV_ITERATION,
            CursorField::FetchInProgress(_) => OPTION_GO_SWITCH,
            CursorField::IterationActive(_) => OPTION_GOING_SWITCH,
            CursorField::ChunkReady(_) => OPTION_READY_TO_CHUNK,
            CursorField::StallWatchdog(_) => OPTION_META_STATE,
        }
    }

    /// Stored value, or `None` when the option should be removed.
    fn value(&self) -> Result<Option<Value>, StoreError> {
        Ok(match self {
            CursorField::IterationIndex(n) | CursorField::PreviousIterationIndex(n) => {
                Some(json!(n))
            }
            CursorField::FetchInProgress(b)
            | CursorField::IterationActive(b)
            | CursorField::ChunkReady(b) => Some(json!(b)),
            CursorField::StallWatchdog(Some(watchdog)) => Some(serde_json::to_value(watchdog)?),
            CursorField::StallWatchdog(None) => None,
        })
    }
}

/// Fields written by [`CursorStore::reset_to_idle`].
pub fn idle_fields() -> Vec<CursorField> {
    vec![
        CursorField::FetchInProgress(false),
        CursorField::IterationIndex(0),
        CursorField::PreviousIterationIndex(0),
        CursorField::IterationActive(false),
        CursorField::ChunkReady(true),
        CursorField::StallWatchdog(None),
    ]
}

#[derive(Clone)]
pub struct CursorStore {
    options: Arc<dyn OptionStore>,
}

impl CursorStore {
    pub fn new(options: Arc<dyn OptionStore>) -> Self {
        Self { options }
    }

    pub async fn load(&self) -> Result<Cursor, StoreError> {
        let defaults = Cursor::default();

        let iteration_index = self
            .read(OPTION_ITERATION)
            .await?
            .and_then(|v| as_index(&v))
            .unwrap_or(defaults.iteration_index);
        let previous_iteration_index = self
            .read(OPTION_PREV_ITERATION)
            .await?
            .and_then(|v| as_index(&v))
            .unwrap_or(defaults.previous_iteration_index);
        let fetch_in_progress = self
            .read(OPTION_GO_SWITCH)
            .await?
            .and_then(|v| as_flag(&v))
            .unwrap_or(defaults.fetch_in_progress);
        let iteration_active = self
            .read(OPTION_GOING_SWITCH)
            .await?
            .and_then(|v| as_flag(&v))
            .unwrap_or(defaults.iteration_active);
        let chunk_ready = self
            .read(OPTION_READY_TO_CHUNK)
            .await?
            .and_then(|v| as_flag(&v))
            .unwrap_or(defaults.chunk_ready);

        let stall_watchdog = match self.read(OPTION_META_STATE).await? {
            None | Some(Value::Null) => None,
            Some(Value::Array(a)) if a.is_empty() => None,
            Some(Value::Object(o)) if o.is_empty() => None,
            Some(raw) => match serde_json::from_value::<StallWatchdog>(raw) {
                Ok(watchdog) => Some(watchdog),
                Err(err) => {
                    warn!(target: TARGET_RETRIEVAL, "Ignoring unreadable stall watchdog: {}", err);
                    None
                }
            },
        };

        Ok(Cursor {
            iteration_index,
            previous_iteration_index,
            fetch_in_progress,
            iteration_active,
            chunk_ready,
            stall_watchdog,
        })
    }

    /// Persists each field individually, verifying every write.
    pub async fn save(&self, updates: &[CursorField]) -> Result<(), StoreError> {
        for update in updates {
            self.persist_verified(update.option_name(), update.value()?).await?;
        }
        Ok(())
    }

    pub async fn reset_to_idle(&self) -> Result<(), StoreError> {
        debug!(target: TARGET_RETRIEVAL, "Resetting retrieval cursor to idle");
        self.save(&idle_fields()).await
    }

    async fn read(&self, name: &str) -> Result<Option<Value>, StoreError> {
        self.options.get_option(name).await
    }

    /// Write, read back, and on mismatch delete and rewrite once. A second
    /// mismatch is logged and left for the watchdog to catch.
    async fn persist_verified(&self, name: &str, value: Option<Value>) -> Result<(), StoreError> {
        match value {
            Some(value) => {
                self.options.update_option(name, &value).await?;
                if self.read(name).await?.as_ref() == Some(&value) {
                    return Ok(());
                }

                warn!(target: TARGET_RETRIEVAL, "Option {} did not persist, rewriting", name);
                self.options.delete_option(name).await?;
                self.options.update_option(name, &value).await?;
                if self.read(name).await?.as_ref() != Some(&value) {
                    warn!(target: TARGET_RETRIEVAL, "Option {} still did not persist; proceeding", name);
                }
            }
            None => {
                self.options.delete_option(name).await?;
                if self.read(name).await?.is_some() {
                    warn!(target: TARGET_RETRIEVAL, "Option {} survived delete, retrying", name);
                    self.options.delete_option(name).await?;
                }
            }
        }
        Ok(())
    }
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as usize),
        _ => None,
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => Some(matches!(s.trim(), "1" | "true")),
        _ => None,
    }
}
