//! Sync client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(rename = "initial_secs", with = "secs")]
    pub initial: Duration,

    /// Upper bound on any delay
    #[serde(rename = "max_secs", with = "secs")]
    pub max: Duration,

    /// Growth factor per consecutive failure
    pub multiplier: u32,

    /// Randomize each delay within `[d/2, d]`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(300),
            multiplier: 2,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Set the initial delay.
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Set the delay cap.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Sync client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Events per sync request
    pub batch_size: usize,

    /// Timeout for each sync request
    #[serde(rename = "request_timeout_secs", with = "secs")]
    pub request_timeout: Duration,

    /// Retry backoff
    pub backoff: BackoffConfig,

    /// Offline queue bound, in entries
    pub queue_capacity: usize,

    /// How often the background task attempts a drain while events are
    /// pending and no retry is scheduled
    #[serde(rename = "sync_interval_secs", with = "secs")]
    pub sync_interval: Duration,

    /// Capacity of the notice channel towards the UI
    pub notice_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            request_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            queue_capacity: 1000,
            sync_interval: Duration::from_secs(30),
            notice_buffer: 64,
        }
    }
}

impl SyncConfig {
    /// Set the batch size (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the queue bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the periodic drain interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
