/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential {
        multiplier: f64,
        max_interval_secs: f64,
    },
}

/// Bounded polling policy shared by every wait in a trial (readiness, address resolution,
/// spec read-back, teardown confirmation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_secs: f64,
    #[serde(default)]
    pub backoff: Backoff,
}

/// Returned when a policy runs out of attempts. Callers turn it into their own failure kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exhausted {
    pub attempts: u32,
    pub waited: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_secs: interval.as_secs_f64(),
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff = Backoff::Exponential {
            multiplier,
            max_interval_secs: max_interval.as_secs_f64(),
        };
        self
    }

    /// Rejects intervals that cannot be turned into a [`Duration`].
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.interval_secs.is_finite() && self.interval_secs >= 0.0,
            "interval_secs must be a finite, non-negative number"
        );
        if let Backoff::Exponential {
            multiplier,
            max_interval_secs,
        } = self.backoff
        {
            anyhow::ensure!(
                multiplier.is_finite() && multiplier > 0.0,
                "multiplier must be a finite, positive number"
            );
            anyhow::ensure!(
                max_interval_secs.is_finite() && max_interval_secs >= 0.0,
                "max_interval_secs must be a finite, non-negative number"
            );
        }
        Ok(())
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.interval_secs.max(0.0);
        let secs = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential {
                multiplier,
                max_interval_secs,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                (base * multiplier.powi(exp)).min(max_interval_secs.max(base))
            }
        };
        Duration::from_secs_f64(secs)
    }

    /// Calls `attempt` until it yields `Some` or the attempts run out. The closure receives the
    /// 1-based attempt number.
    pub async fn poll<T, F, Fut>(&self, mut attempt: F) -> Result<T, Exhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let start = Instant::now();
        for n in 1..=self.max_attempts {
            if let Some(value) = attempt(n).await {
                return Ok(value);
            }
            trace!("attempt {}/{} did not succeed", n, self.max_attempts);
            if n < self.max_attempts {
                tokio::time::sleep(self.delay(n)).await;
            }
        }

        Err(Exhausted {
            attempts: self.max_attempts,
            waited: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_is_capped() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1))
            .with_backoff(2.0, Duration::from_secs(5));

        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(9), Duration::from_secs(5));
    }

    #[test]
    fn infinite_intervals_are_rejected() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert!(policy.validate().is_ok());

        policy.interval_secs = f64::INFINITY;
        assert!(policy.validate().is_err());

        let capped = RetryPolicy::fixed(3, Duration::from_secs(1));
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                multiplier: 2.0,
                max_interval_secs: f64::INFINITY,
            },
            ..capped
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn poll_returns_first_success() -> anyhow::Result<()> {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let value = policy
            .poll(|n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { (n == 3).then_some("ready") }
            })
            .await
            .map_err(|e| anyhow::anyhow!("exhausted after {}", e.attempts))?;

        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn poll_gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let res: Result<(), Exhausted> = policy
            .poll(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            })
            .await;

        assert_eq!(res.map_err(|e| e.attempts), Err(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
