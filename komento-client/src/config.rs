use std::time::Duration;

fn default_cooldown() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_subscribe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(8)
}

/// Timings of the sync scheduler and change listener
///
/// Durations are (de)serialized as `{ "secs": u64, "nanos": u32 }`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    /// Manual and foreground syncs closer than this to the previous sync are dropped
    #[serde(default = "default_cooldown")]
    pub cooldown: Duration,

    /// Interval of the fallback polling, active while the live channel is down
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Time the backend has to acknowledge a live channel
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout: Duration,

    /// Retries of a failed refetch before the error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: Duration,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            cooldown: default_cooldown(),
            poll_interval: default_poll_interval(),
            subscribe_timeout: default_subscribe_timeout(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `attempt` (starting at 0)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}
