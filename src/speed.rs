use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SpeedCacheConfig;
use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};

pub const SPEED_CACHE_VERSION: &str = "1";
const SPEED_CACHE_KEY: &str = "speed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeedSample {
    pub token_count: u64,
    pub sampled_at_ms: i64,
    pub tokens_per_second: Option<u64>,
    /// When `tokens_per_second` was last computed.
    pub rate_at_ms: Option<i64>,
}

/// Output-token throughput measured between successive renders.
pub struct SpeedTracker<B = FileBackend> {
    store: CacheStore<SpeedSample, B>,
    update_interval_ms: i64,
    ttl_ms: i64,
}

impl SpeedTracker {
    pub fn open(path: PathBuf, config: &SpeedCacheConfig) -> Self {
        Self::with_backend(FileBackend::new(path), config)
    }
}

impl<B: CacheBackend> SpeedTracker<B> {
    pub fn with_backend(backend: B, config: &SpeedCacheConfig) -> Self {
        Self {
            store: CacheStore::new(backend, SPEED_CACHE_VERSION, TtlRule::Never, 1),
            update_interval_ms: i64::try_from(config.update_interval_ms).unwrap_or(i64::MAX),
            ttl_ms: i64::try_from(config.ttl_ms).unwrap_or(i64::MAX),
        }
    }

    /// Folds in the session's running output-token total and returns the
    /// current rate, if one is fresh.
    pub fn observe(&self, total_output_tokens: u64, now: DateTime<Utc>) -> Option<u64> {
        let now_ms = now.timestamp_millis();

        let sample = self.store.get_at(SPEED_CACHE_KEY, now);
        let Some(previous) = sample else {
            self.store.put_at(SPEED_CACHE_KEY, seed(total_output_tokens, now_ms), now);
            return None;
        };

        let elapsed = now_ms.saturating_sub(previous.sampled_at_ms);
        if elapsed < self.update_interval_ms {
            return self.fresh_rate(&previous, now_ms);
        }
        // a stale baseline or a shrinking total (new session) starts over
        if elapsed > self.ttl_ms || total_output_tokens < previous.token_count {
            self.store.put_at(SPEED_CACHE_KEY, seed(total_output_tokens, now_ms), now);
            return None;
        }

        let delta = total_output_tokens - previous.token_count;
        let rate = (delta as f64 / elapsed as f64 * 1000.0).round() as u64;
        let next = SpeedSample {
            token_count: total_output_tokens,
            sampled_at_ms: now_ms,
            tokens_per_second: Some(rate),
            rate_at_ms: Some(now_ms),
        };
        self.store.put_at(SPEED_CACHE_KEY, next, now);
        Some(rate)
    }

    pub fn current(&self, now: DateTime<Utc>) -> Option<u64> {
        let sample = self.store.get_at(SPEED_CACHE_KEY, now)?;
        self.fresh_rate(&sample, now.timestamp_millis())
    }

    pub fn store(&self) -> &CacheStore<SpeedSample, B> {
        &self.store
    }

    fn fresh_rate(&self, sample: &SpeedSample, now_ms: i64) -> Option<u64> {
        let rate_at = sample.rate_at_ms?;
        if now_ms.saturating_sub(rate_at) > self.ttl_ms {
            return None;
        }
        sample.tokens_per_second
    }
}

fn seed(token_count: u64, now_ms: i64) -> SpeedSample {
    SpeedSample {
        token_count,
        sampled_at_ms: now_ms,
        tokens_per_second: None,
        rate_at_ms: None,
    }
}

pub fn format_speed(tokens_per_second: u64) -> String {
    if tokens_per_second < 1_000 {
        format!("{tokens_per_second} t/s")
    } else {
        format!("{:.1}k t/s", tokens_per_second as f64 / 1_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, millis_to_datetime};

    fn at(ms: i64) -> DateTime<Utc> {
        millis_to_datetime(ms).expect("valid millis")
    }

    fn tracker(backend: &MemoryBackend) -> SpeedTracker<&MemoryBackend> {
        SpeedTracker::with_backend(backend, &SpeedCacheConfig::default())
    }

    #[test]
    fn first_observation_only_seeds() {
        let backend = MemoryBackend::new();
        let speed = tracker(&backend);

        assert_eq!(speed.observe(1_000, at(0)), None);
        assert_eq!(speed.current(at(0)), None);
    }

    #[test]
    fn rate_is_tokens_per_second_between_samples() {
        let backend = MemoryBackend::new();
        let speed = tracker(&backend);

        speed.observe(1_000, at(0));
        assert_eq!(speed.observe(1_500, at(1_000)), None);
        assert_eq!(speed.observe(2_000, at(4_000)), Some(250));
        assert_eq!(speed.current(at(6_000)), Some(250));
        assert_eq!(speed.current(at(9_001)), None);
    }

    #[test]
    fn samples_inside_interval_keep_previous_rate() {
        let backend = MemoryBackend::new();
        let speed = tracker(&backend);

        speed.observe(0, at(0));
        speed.observe(300, at(3_000));
        assert_eq!(speed.observe(900, at(4_000)), Some(100));
        assert_eq!(speed.observe(900, at(5_000)), Some(300));
    }

    #[test]
    fn shrinking_total_reseeds() {
        let backend = MemoryBackend::new();
        let speed = tracker(&backend);

        speed.observe(5_000, at(0));
        assert_eq!(speed.observe(10, at(3_000)), None);
        assert_eq!(speed.observe(210, at(5_000)), Some(100));
    }

    #[test]
    fn stale_baseline_reseeds() {
        let backend = MemoryBackend::new();
        let speed = tracker(&backend);

        speed.observe(0, at(0));
        assert_eq!(speed.observe(60_000, at(600_000)), None);
        assert_eq!(speed.observe(60_400, at(602_000)), Some(200));
    }

    #[test]
    fn speed_formatting() {
        assert_eq!(format_speed(999), "999 t/s");
        assert_eq!(format_speed(1_500), "1.5k t/s");
    }
}
