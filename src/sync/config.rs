use std::time::Duration;

use rand::Rng;
use typed_builder::TypedBuilder;

/// Bounded retries with capped exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    #[builder(default = 4)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(100))]
    pub initial_backoff: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub max_backoff: Duration,
    /// Scales each delay by a random factor in `[0.5, 1.0]`.
    #[builder(default = true)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self::builder().max_attempts(1).build()
    }

    /// Delay to wait before attempt number `attempt` (1-based; the first
    /// retry is attempt 2).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Tuning for a sync engine. Every field has a default.
#[derive(Clone, Debug, TypedBuilder)]
pub struct SyncConfig {
    /// Upper bound for a single fetch. Exceeding it counts as a transient
    /// failure.
    #[builder(default = Duration::from_secs(5))]
    pub fetch_timeout: Duration,
    /// Retries for record fetches, during the walk and live.
    #[builder(default)]
    pub retry: RetryPolicy,
    /// How long an unresolved delete patch is kept before it is abandoned.
    /// Also how long a settled delete is remembered for idempotence.
    #[builder(default = Duration::from_secs(300))]
    pub patch_horizon: Duration,
    /// How often expired patches are swept. Raised to 10ms if smaller.
    #[builder(default = Duration::from_secs(5))]
    pub patch_sweep_interval: Duration,
    /// Fetches allowed in flight at once while live. At least one.
    #[builder(default = 16)]
    pub max_in_flight: usize,
    /// Automatic resubscription after the event feed drops.
    #[builder(default = RetryPolicy::builder()
        .max_attempts(5)
        .initial_backoff(Duration::from_millis(250))
        .max_backoff(Duration::from_secs(10))
        .build())]
    pub resubscribe: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
