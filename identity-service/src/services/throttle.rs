//! Fixed-window attempt throttling on top of a keyed counter store.
//!
//! The counter store is the only shared state. Increments are atomic per key
//! in both backends, so a burst of parallel attempts cannot slip past the
//! limit.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::error::ServiceError;
use crate::config::ThrottlePolicyConfig;

/// Counter value after an increment, plus the time left in its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub resets_in: Duration,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`. The first increment opens a window of
    /// `window` length; the counter disappears when the window closes.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, anyhow::Error>;

    async fn reset(&self, key: &str) -> Result<(), anyhow::Error>;
}

/// Process-local counter store.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, (u64, Instant)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, anyhow::Error> {
        let now = Instant::now();
        let result = {
            let mut entry = self
                .counters
                .entry(key.to_string())
                .or_insert((0, now + window));
            let (count, expires_at) = entry.value_mut();
            if *expires_at <= now {
                *count = 0;
                *expires_at = now + window;
            }
            *count += 1;
            WindowCount {
                count: *count,
                resets_in: expires_at.saturating_duration_since(now),
            }
        };

        self.counters.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(result)
    }

    async fn reset(&self, key: &str) -> Result<(), anyhow::Error> {
        self.counters.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed { remaining: u64 },
    Blocked { retry_after: Duration },
}

/// One throttling policy (login, password change, protocol, federation).
#[derive(Clone)]
pub struct LoginThrottle {
    store: Arc<dyn CounterStore>,
    namespace: &'static str,
    max_attempts: u64,
    window: Duration,
}

impl LoginThrottle {
    pub fn new(
        store: Arc<dyn CounterStore>,
        namespace: &'static str,
        policy: ThrottlePolicyConfig,
    ) -> Self {
        Self {
            store,
            namespace,
            max_attempts: u64::from(policy.max_attempts),
            window: Duration::from_secs(policy.window_seconds),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("throttle:{}:{}", self.namespace, key)
    }

    /// Records one attempt against `key` and decides whether it may proceed.
    pub async fn check_and_record(&self, key: &str) -> Result<ThrottleDecision, ServiceError> {
        let counted = self
            .store
            .increment(&self.scoped(key), self.window)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, namespace = self.namespace, "Throttle store unavailable");
                ServiceError::Internal(e)
            })?;

        if counted.count > self.max_attempts {
            Ok(ThrottleDecision::Blocked {
                retry_after: counted.resets_in,
            })
        } else {
            Ok(ThrottleDecision::Allowed {
                remaining: self.max_attempts - counted.count,
            })
        }
    }

    /// Like [`check_and_record`](Self::check_and_record) but converts a block
    /// into `ThrottleExceeded` with a whole-second retry hint.
    pub async fn guard(&self, key: &str) -> Result<(), ServiceError> {
        match self.check_and_record(key).await? {
            ThrottleDecision::Allowed { .. } => Ok(()),
            ThrottleDecision::Blocked { retry_after } => {
                tracing::warn!(namespace = self.namespace, "Attempt throttled");
                Err(ServiceError::ThrottleExceeded {
                    retry_after_secs: retry_after_secs(retry_after),
                })
            }
        }
    }

    /// Clears the counter after a successful attempt. Best-effort.
    pub async fn reset(&self, key: &str) {
        if let Err(e) = self.store.reset(&self.scoped(key)).await {
            tracing::warn!(error = %e, namespace = self.namespace, "Failed to reset throttle counter");
        }
    }
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

/// Throttle key component for an email or username. Hashed so raw addresses
/// never land in the counter store.
pub fn subject_key(subject: &str) -> String {
    let digest = Sha256::digest(subject.trim().to_lowercase().as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max_attempts: u32, window_seconds: u64) -> LoginThrottle {
        LoginThrottle::new(
            Arc::new(MemoryCounterStore::new()),
            "login",
            ThrottlePolicyConfig {
                max_attempts,
                window_seconds,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_attempt_in_window_is_blocked() {
        let throttle = throttle(5, 60);
        for expected_remaining in (0..5).rev() {
            assert_eq!(
                throttle.check_and_record("10.0.0.1").await.unwrap(),
                ThrottleDecision::Allowed {
                    remaining: expected_remaining
                }
            );
        }
        assert!(matches!(
            throttle.check_and_record("10.0.0.1").await.unwrap(),
            ThrottleDecision::Blocked { .. }
        ));

        // Other keys are unaffected.
        assert!(matches!(
            throttle.check_and_record("10.0.0.2").await.unwrap(),
            ThrottleDecision::Allowed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_allows_fresh_attempt() {
        let throttle = throttle(5, 60);
        for _ in 0..6 {
            throttle.check_and_record("k").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            throttle.check_and_record("k").await.unwrap(),
            ThrottleDecision::Allowed { remaining: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reports_retry_after() {
        let throttle = throttle(1, 60);
        throttle.guard("k").await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        match throttle.guard("k").await {
            Err(ServiceError::ThrottleExceeded { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 40)
            }
            other => panic!("expected throttle, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_counter() {
        let throttle = throttle(1, 60);
        throttle.guard("k").await.unwrap();
        assert!(throttle.guard("k").await.is_err());
        throttle.reset("k").await;
        assert!(throttle.guard("k").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_burst_cannot_exceed_limit() {
        let throttle = throttle(5, 60);
        let attempts = (0..50).map(|_| {
            let t = throttle.clone();
            tokio::spawn(async move { t.check_and_record("burst").await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let allowed = results
            .into_iter()
            .filter(|r| matches!(r, Ok(ThrottleDecision::Allowed { .. })))
            .count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn subject_key_is_case_insensitive_and_opaque() {
        let a = subject_key("Alice@Example.com");
        let b = subject_key("alice@example.com ");
        assert_eq!(a, b);
        assert!(!a.contains('@'));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
