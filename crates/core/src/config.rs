//! # Engine Configuration
//!
//! All tunables for the coordination engine, plus the single retry policy
//! applied uniformly around every external capability call.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;

/// Bounded retry with exponential backoff.
///
/// One policy object wraps every delegated call (draft, reflect, synthesize,
/// store writes) instead of ad-hoc loops at each call site. Only transient
/// failures are retried; permanent ones surface immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, CapabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CapabilityError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_message = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed for {}: {}. Retrying in {:?}...",
                        attempt,
                        attempts,
                        op_name,
                        err,
                        delay
                    );
                    last_message = err.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(CapabilityError::Transient(format!(
            "{op_name} failed after {attempts} attempts: {last_message}"
        )))
    }
}

/// Configuration for the coordination engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Agent that receives the final synthesis call.
    pub synthesis_agent: String,
    /// Per-agent deadline for a single draft call.
    pub draft_timeout: Duration,
    /// Deadline for the synthesis call.
    pub synthesis_timeout: Duration,
    /// Global watchdog for the whole reflection phase.
    pub reflection_deadline: Duration,
    /// How long one reflection request may stay in-progress before it is
    /// reverted to pending.
    pub reflection_timeout: Duration,
    /// Dispatch attempts per reflection request before it is failed.
    pub max_reflection_attempts: u32,
    /// Global cap on concurrently in-flight reflections, across all runs.
    pub max_reflection_concurrency: usize,
    /// Retained messages per run on the bus; oldest evicted past this.
    pub history_capacity: usize,
    /// Retention window for a run's records. The expiry is fixed once at run
    /// creation and shared by every record written for that run.
    pub run_ttl: Duration,
    /// Topics longer than this are rejected before run creation.
    pub max_topic_len: usize,
    /// Retry policy around every external call.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            synthesis_agent: "editor".to_string(),
            draft_timeout: Duration::from_secs(60),
            synthesis_timeout: Duration::from_secs(120),
            reflection_deadline: Duration::from_secs(300),
            reflection_timeout: Duration::from_secs(30),
            max_reflection_attempts: 3,
            max_reflection_concurrency: 4,
            history_capacity: 256,
            run_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_topic_len: 512,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.synthesis_agent, "editor");
        assert_eq!(config.max_reflection_attempts, 3);
        assert_eq!(config.max_reflection_concurrency, 4);
    }

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let policy = RetryPolicy::default();
        let mut calls = 0u32;
        let result = policy
            .run("flaky", || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 3 {
                        Err(CapabilityError::Transient("overloaded".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent() {
        let policy = RetryPolicy::default();
        let mut calls = 0u32;
        let result: Result<(), _> = policy
            .run("broken", || {
                calls += 1;
                async { Err(CapabilityError::Permanent("bad request".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(CapabilityError::Permanent(_))));
        assert_eq!(calls, 1);
    }
}
