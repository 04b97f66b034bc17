//! Runtime configuration for the retrieval service.

use chrono::Duration;

use crate::environment::{get_env_var_as_vec, get_env_var_opt, get_env_var_or};

/// Default retrieval interval in minutes, used when neither the environment nor
/// the persisted `pf_retrieval_frequency` option provides one.
pub const DEFAULT_INTERVAL_MINUTES: u64 = 30;

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub database_path: String,
    pub bind_address: String,
    pub port: u16,
    /// Overrides the persisted interval when set.
    pub interval_minutes: Option<u64>,
    /// How long a stall-watchdog snapshot must stay unchanged before it is condemned.
    pub retrigger_window: Duration,
    /// Age after which a watchdog that keeps seeing movement gives up and resets.
    pub stale_window: Duration,
    /// Hard cap on feeds visited by a single chunk. `0` means feed-list length + 1.
    pub max_steps_per_chunk: usize,
    /// Base URL the service uses to request its own next chunk.
    pub self_trigger_url: Option<String>,
    /// Feed kinds left out of the feed list snapshot.
    pub excluded_feed_kinds: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            database_path: "pressforward.db".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            interval_minutes: None,
            retrigger_window: Duration::minutes(120),
            stale_window: Duration::hours(24),
            max_steps_per_chunk: 0,
            self_trigger_url: None,
            excluded_feed_kinds: Vec::new(),
        }
    }
}

impl RetrievalConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: get_env_var_or("DATABASE_PATH", defaults.database_path),
            bind_address: get_env_var_or("BIND_ADDRESS", defaults.bind_address),
            port: get_env_var_or("PORT", defaults.port),
            interval_minutes: get_env_var_opt("RETRIEVAL_INTERVAL_MINUTES")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0),
            retrigger_window: Duration::minutes(get_env_var_or("RETRIGGER_WINDOW_MINUTES", 120)),
            stale_window: Duration::hours(get_env_var_or("STALE_WINDOW_HOURS", 24)),
            max_steps_per_chunk: get_env_var_or("MAX_STEPS_PER_CHUNK", 0),
            self_trigger_url: get_env_var_opt("SELF_TRIGGER_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            excluded_feed_kinds: get_env_var_as_vec("FEED_LIST_FILTER_KINDS", ';'),
        }
    }

    /// The step cap for a feed list of `feed_count` entries.
    pub fn step_cap(&self, feed_count: usize) -> usize {
        if self.max_steps_per_chunk == 0 {
            feed_count + 1
        } else {
            self.max_steps_per_chunk
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_cap_defaults_to_feed_count() {
        let config = RetrievalConfig::default();
        assert_eq!(config.step_cap(3), 4);
        assert_eq!(config.step_cap(0), 1);

        let capped = RetrievalConfig {
            max_steps_per_chunk: 2,
            ..RetrievalConfig::default()
        };
        assert_eq!(capped.step_cap(10), 2);
    }

    #[test]
    fn test_default_windows() {
        let config = RetrievalConfig::default();
        assert_eq!(config.retrigger_window, Duration::hours(2));
        assert_eq!(config.stale_window, Duration::hours(24));
        assert!(config.interval_minutes.is_none());
    }
}
