use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MIN_MESSAGES_PER_BATCH: u32 = 1;
pub const MIN_DELAY_BETWEEN_MESSAGES_MS: u64 = 1_000;
pub const MIN_DELAY_BETWEEN_BATCHES_MS: u64 = 5_000;

/// Pacing policy for the dispatch queue. Delays are in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub messages_per_batch: u32,
    pub delay_between_messages: u64,
    pub delay_between_batches: u64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_batch: 10,
            delay_between_messages: 3_000,
            delay_between_batches: 60_000,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Raise every field to its enforced minimum. Values are clamped, never rejected.
    pub fn clamped(self) -> Self {
        Self {
            messages_per_batch: self.messages_per_batch.max(MIN_MESSAGES_PER_BATCH),
            delay_between_messages: self.delay_between_messages.max(MIN_DELAY_BETWEEN_MESSAGES_MS),
            delay_between_batches: self.delay_between_batches.max(MIN_DELAY_BETWEEN_BATCHES_MS),
            enabled: self.enabled,
        }
    }

    /// Merge a partial update over this config and clamp the result.
    pub fn apply(self, update: &RateLimitUpdate) -> Self {
        Self {
            messages_per_batch: update.messages_per_batch.unwrap_or(self.messages_per_batch),
            delay_between_messages: update
                .delay_between_messages
                .unwrap_or(self.delay_between_messages),
            delay_between_batches: update
                .delay_between_batches
                .unwrap_or(self.delay_between_batches),
            enabled: update.enabled.unwrap_or(self.enabled),
        }
        .clamped()
    }

    pub fn is_within_minimums(&self) -> bool {
        self.messages_per_batch >= MIN_MESSAGES_PER_BATCH
            && self.delay_between_messages >= MIN_DELAY_BETWEEN_MESSAGES_MS
            && self.delay_between_batches >= MIN_DELAY_BETWEEN_BATCHES_MS
    }

    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_messages)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches)
    }

    pub fn batch_size(&self) -> usize {
        self.messages_per_batch.max(MIN_MESSAGES_PER_BATCH) as usize
    }
}

/// Partial rate-limit update. Missing fields keep their current value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitUpdate {
    pub messages_per_batch: Option<u32>,
    pub delay_between_messages: Option<u64>,
    pub delay_between_batches: Option<u64>,
    pub enabled: Option<bool>,
}

impl From<RateLimitConfig> for RateLimitUpdate {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            messages_per_batch: Some(config.messages_per_batch),
            delay_between_messages: Some(config.delay_between_messages),
            delay_between_batches: Some(config.delay_between_batches),
            enabled: Some(config.enabled),
        }
    }
}
