use parking_lot::RwLock;
use tracing::info;

use herald_core::events::SystemEvent;
use herald_core::rate_limit::{RateLimitConfig, RateLimitUpdate};

use crate::broadcast::Broadcaster;

/// Process-wide rate-limit policy. Every stored value is clamped.
pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    broadcaster: Broadcaster,
}

impl RateLimiter {
    pub fn new(initial: RateLimitConfig, broadcaster: Broadcaster) -> Self {
        Self {
            config: RwLock::new(initial.clamped()),
            broadcaster,
        }
    }

    pub fn current(&self) -> RateLimitConfig {
        *self.config.read()
    }

    /// Merge a partial update, clamp, store, and broadcast the effective config.
    pub fn update(&self, update: &RateLimitUpdate) -> RateLimitConfig {
        let effective = {
            let mut config = self.config.write();
            *config = config.apply(update);
            *config
        };
        info!(
            messages_per_batch = effective.messages_per_batch,
            delay_between_messages = effective.delay_between_messages,
            delay_between_batches = effective.delay_between_batches,
            enabled = effective.enabled,
            "rate limit updated"
        );
        self.broadcaster
            .broadcast(SystemEvent::RateLimitUpdated(effective));
        effective
    }
}
