use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::store::{CacheBackend, FileBackend};

/// Remembers the last failed credential lookup so that a slow or prompting
/// lookup is not retried on every render.
///
/// The backing document is a bare decimal millisecond timestamp.
pub struct BackoffGate<B = FileBackend> {
    backend: B,
    window: Duration,
}

impl<B: CacheBackend> BackoffGate<B> {
    pub fn new(backend: B, window: Duration) -> Self {
        Self { backend, window }
    }

    pub fn should_attempt(&self) -> bool {
        self.should_attempt_at(Utc::now())
    }

    pub fn should_attempt_at(&self, now: DateTime<Utc>) -> bool {
        let Some(failed_at) = self.last_failure_ms() else {
            return true;
        };
        let elapsed = now.timestamp_millis().saturating_sub(failed_at);
        let blocked = i128::from(elapsed) < self.window.as_millis() as i128;
        if blocked {
            debug!(elapsed_ms = elapsed, "credential lookup suppressed by backoff");
        }
        !blocked
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now());
    }

    pub fn record_failure_at(&self, now: DateTime<Utc>) {
        if let Err(err) = self.backend.store(&now.timestamp_millis().to_string()) {
            warn!(gate = %self.backend.describe(), error = %err, "failed to record credential failure");
        }
    }

    pub fn reset(&self) {
        if let Err(err) = self.backend.clear() {
            warn!(gate = %self.backend.describe(), error = %err, "failed to clear backoff");
        }
    }

    pub fn last_failure_ms(&self) -> Option<i64> {
        let raw = self.backend.load().ok().flatten()?;
        raw.trim().parse::<i64>().ok()
    }
}
