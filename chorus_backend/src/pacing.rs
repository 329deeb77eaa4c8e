//! Backpressure for persona turns.
//!
//! Two knobs live here: a random pre-processing delay that desynchronizes
//! personas reacting to the same message, and a minimum interval between
//! backend requests that share a credential.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::ChorusConfig;

pub struct Pacing {
    jitter_min: Duration,
    jitter_max: Duration,
    min_interval: Duration,
    /// Per-credential time at which the next request may go out.
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl Pacing {
    pub fn new(jitter_min: Duration, jitter_max: Duration, min_interval: Duration) -> Self {
        let (jitter_min, jitter_max) = if jitter_min <= jitter_max {
            (jitter_min, jitter_max)
        } else {
            (jitter_max, jitter_min)
        };
        Self {
            jitter_min,
            jitter_max,
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ChorusConfig) -> Self {
        Self::new(
            Duration::from_millis(config.jitter_min_ms),
            Duration::from_millis(config.jitter_max_ms),
            Duration::from_millis(config.min_request_interval_ms),
        )
    }

    /// No jitter and no request spacing.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn jitter_delay(&self) -> Duration {
        if self.jitter_max.is_zero() || self.jitter_min == self.jitter_max {
            return self.jitter_min;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub async fn jitter(&self) {
        let delay = self.jitter_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Reserve the next request slot for `credential` and return how long the
    /// caller has to wait before using it.
    fn reserve_slot(&self, credential: &str) -> Duration {
        let now = Instant::now();
        let mut slots = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots
            .get(credential)
            .copied()
            .filter(|slot| *slot > now)
            .unwrap_or(now);
        slots.insert(credential.to_string(), slot + self.min_interval);
        slot.saturating_duration_since(now)
    }

    pub async fn wait_for_request_slot(&self, credential: &str) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = self.reserve_slot(credential);
        if !wait.is_zero() {
            tracing::debug!("Pacing backend request for {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
