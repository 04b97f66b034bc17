//! Heartbeat, cycle counters and the admin status readout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::cursor::Cursor;
use crate::config::DEFAULT_INTERVAL_MINUTES;
use crate::error::StoreError;
use crate::store::{OptionStore, RecordId};
use crate::TARGET_RETRIEVAL;

pub const OPTION_HEARTBEAT: &str = "pf_feeds_hb_state";
pub const OPTION_CYCLE_STATE: &str = "pf_iterate_cycle_state";
pub const OPTION_RETRIEVAL_FREQUENCY: &str = "pf_retrieval_frequency";

/// Where the last step was when it picked its feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub feed_id: RecordId,
    pub feed_title: String,
    pub last_key: usize,
    pub feeds_iteration: usize,
    pub total_feeds: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleCounter {
    ChunksBegun,
    CyclesBegun,
    CyclesEnded,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    #[serde(default)]
    pub retrieval_chunks_begun: u64,
    #[serde(default)]
    pub retrieval_cycles_begun: u64,
    #[serde(default)]
    pub retrieval_cycles_ended: u64,
    #[serde(default)]
    pub last_reset: Option<DateTime<Utc>>,
}

impl CycleStats {
    fn bump(&mut self, counter: CycleCounter) {
        let slot = match counter {
            CycleCounter::ChunksBegun => &mut self.retrieval_chunks_begun,
            CycleCounter::CyclesBegun => &mut self.retrieval_cycles_begun,
            CycleCounter::CyclesEnded => &mut self.retrieval_cycles_ended,
        };
        *slot += 1;
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rust_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("GIT_HASH"),
            build_timestamp: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
            rust_version: option_env!("RUST_VERSION").unwrap_or("unknown"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub cursor: Cursor,
    pub heartbeat: Option<Heartbeat>,
    pub cycle_stats: CycleStats,
    pub interval_minutes: u64,
    pub build: BuildInfo,
}

#[derive(Clone)]
pub struct StatusStore {
    options: Arc<dyn OptionStore>,
}

impl StatusStore {
    pub fn new(options: Arc<dyn OptionStore>) -> Self {
        Self { options }
    }

    pub async fn heartbeat(&self) -> Result<Option<Heartbeat>, StoreError> {
        Ok(self
            .options
            .get_option(OPTION_HEARTBEAT)
            .await?
            .and_then(|raw| serde_json::from_value(raw).ok()))
    }

    pub async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        self.options
            .update_option(OPTION_HEARTBEAT, &serde_json::to_value(heartbeat)?)
            .await?;
        Ok(())
    }

    pub async fn cycle_stats(&self) -> Result<CycleStats, StoreError> {
        match self.options.get_option(OPTION_CYCLE_STATE).await? {
            None | Some(Value::Null) => Ok(CycleStats::default()),
            Some(raw) => Ok(serde_json::from_value(raw).unwrap_or_else(|err| {
                warn!(target: TARGET_RETRIEVAL, "Resetting unreadable cycle statistics: {}", err);
                CycleStats::default()
            })),
        }
    }

    pub async fn bump(&self, counter: CycleCounter) -> Result<CycleStats, StoreError> {
        let mut stats = self.cycle_stats().await?;
        stats.bump(counter);
        self.options
            .update_option(OPTION_CYCLE_STATE, &serde_json::to_value(&stats)?)
            .await?;
        Ok(stats)
    }

    pub async fn reset_cycle_stats(&self, now: DateTime<Utc>) -> Result<CycleStats, StoreError> {
        let stats = CycleStats {
            last_reset: Some(now),
            ..CycleStats::default()
        };
        self.options
            .update_option(OPTION_CYCLE_STATE, &serde_json::to_value(&stats)?)
            .await?;
        Ok(stats)
    }

    /// The configured override, else the persisted frequency, else the default.
    pub async fn interval_minutes(&self, configured: Option<u64>) -> Result<u64, StoreError> {
        if let Some(minutes) = configured {
            return Ok(minutes);
        }
        let persisted = self.options.get_option(OPTION_RETRIEVAL_FREQUENCY).await?;
        let minutes = match persisted {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(minutes.filter(|m| *m > 0).unwrap_or(DEFAULT_INTERVAL_MINUTES))
    }
}
