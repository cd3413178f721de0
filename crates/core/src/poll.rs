//! Caller-side polling with exponential backoff
//!
//! The harness never retries on its own. Scenarios that wait for an
//! asynchronous effect inside a container (a server starting to listen, a
//! file appearing) express the wait as repeated boolean probes through
//! [`poll_until`].

use crate::errors::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

/// Jitter strategy for poll delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JitterStrategy {
    /// No randomization
    None,
    /// Full jitter: random delay between 0 and calculated delay
    FullJitter,
    /// Equal jitter: half calculated delay plus random half
    #[default]
    EqualJitter,
}

/// Configuration for polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Maximum number of probe calls (at least one)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter strategy to apply
    pub jitter: JitterStrategy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: JitterStrategy::default(),
        }
    }
}

impl PollConfig {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: JitterStrategy,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, delay, delay, JitterStrategy::None)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        // base_delay * 2^attempt, capped
        let exponential = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Delay after a false probe (0-based attempt)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.jittered(self.backoff(attempt), &mut fastrand::Rng::new())
    }

    fn jittered(&self, delay: Duration, rng: &mut fastrand::Rng) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::FullJitter => Duration::from_millis(rng.u64(0..=delay_ms)),
            JitterStrategy::EqualJitter => {
                let half = delay_ms / 2;
                Duration::from_millis(half + rng.u64(0..=half))
            }
        }
    }

    /// Calculate delay with seeded RNG for testing
    #[cfg(test)]
    fn calculate_delay_seeded(&self, attempt: u32, seed: u64) -> Duration {
        self.jittered(self.backoff(attempt), &mut fastrand::Rng::with_seed(seed))
    }
}

/// Await `probe` until it yields `true` or attempts run out.
///
/// Returns `Ok(true)` as soon as the probe holds and `Ok(false)` when every
/// attempt returned `false`. Probe errors are returned immediately; they are
/// never retried.
#[instrument(level = "debug", skip(probe))]
pub async fn poll_until<F, Fut>(config: &PollConfig, mut probe: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if config.max_attempts == 0 {
        return Err(HarnessError::InvalidArgument {
            message: "poll max_attempts must be at least 1".to_string(),
        });
    }

    for attempt in 0..config.max_attempts {
        if probe().await? {
            debug!("Probe held on attempt {}", attempt + 1);
            return Ok(true);
        }

        if attempt + 1 < config.max_attempts {
            let delay = config.calculate_delay(attempt);
            debug!(
                "Probe false on attempt {}/{}, sleeping {:?}",
                attempt + 1,
                config.max_attempts,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    debug!("Probe never held after {} attempts", config.max_attempts);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = PollConfig::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            JitterStrategy::None,
        );
        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(config.calculate_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds_seeded() {
        let full = PollConfig::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            JitterStrategy::FullJitter,
        );
        let equal = PollConfig {
            jitter: JitterStrategy::EqualJitter,
            ..full.clone()
        };

        for seed in 0..50 {
            let delay = full.calculate_delay_seeded(1, seed);
            assert!(delay <= Duration::from_millis(200));

            let delay = equal.calculate_delay_seeded(1, seed);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }

        assert_eq!(
            full.calculate_delay_seeded(2, 7),
            full.calculate_delay_seeded(2, 7)
        );
    }

    #[tokio::test]
    async fn test_poll_until_eventually_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::fixed(5, Duration::from_millis(1));

        let held = poll_until(&config, || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();

        assert!(held);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_exhausted_returns_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::fixed(4, Duration::from_millis(1));

        let held = poll_until(&config, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await
        .unwrap();

        assert!(!held);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_until_propagates_errors_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::fixed(5, Duration::from_millis(1));

        let result = poll_until(&config, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<bool, _>(HarnessError::Probe {
                    predicate: "listening tcp://8123".to_string(),
                    message: "exit code 2".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(HarnessError::Probe { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_rejects_zero_attempts() {
        let config = PollConfig::fixed(0, Duration::from_millis(1));
        let result = poll_until(&config, || async { Ok(true) }).await;
        assert!(matches!(result, Err(HarnessError::InvalidArgument { .. })));
    }
}
