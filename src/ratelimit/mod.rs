//! In-memory rate limiting for WebSocket connect and REST operations,
//! adapted from the teacher's voice-join rate limiter to a generic
//! per-key minimum-interval gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::AppError;

/// Per-key minimum-interval rate limiter: a key may act at most once per
/// `min_interval`.
pub struct RateLimiter<K> {
    last_action: Arc<RwLock<HashMap<K, Instant>>>,
    min_interval: Duration,
}

impl<K> RateLimiter<K>
where
    K: std::hash::Hash + Eq + Clone,
{
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self { last_action: Arc::new(RwLock::new(HashMap::new())), min_interval }
    }

    /// Checks and, on success, records the action under `key`.
    pub async fn check(&self, key: K) -> Result<(), AppError> {
        let mut map = self.last_action.write().await;
        if let Some(last) = map.get(&key) {
            if last.elapsed() < self.min_interval {
                return Err(AppError::RateLimited);
            }
        }
        map.insert(key, Instant::now());
        Ok(())
    }

    /// Drops entries older than `10x min_interval`; call periodically to
    /// bound memory.
    pub async fn cleanup(&self) {
        let threshold = self.min_interval * 10;
        let mut map = self.last_action.write().await;
        map.retain(|_, last| last.elapsed() < threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn first_action_always_allowed() {
        let limiter: RateLimiter<Uuid> = RateLimiter::new(Duration::from_millis(100));
        assert!(limiter.check(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn rapid_repeat_is_blocked() {
        let limiter: RateLimiter<Uuid> = RateLimiter::new(Duration::from_millis(100));
        let key = Uuid::new_v4();
        assert!(limiter.check(key).await.is_ok());
        assert!(limiter.check(key).await.is_err());
    }

    #[tokio::test]
    async fn allowed_again_after_interval_elapses() {
        let limiter: RateLimiter<Uuid> = RateLimiter::new(Duration::from_millis(30));
        let key = Uuid::new_v4();
        assert!(limiter.check(key).await.is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.check(key).await.is_ok());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter: RateLimiter<Uuid> = RateLimiter::new(Duration::from_millis(100));
        assert!(limiter.check(Uuid::new_v4()).await.is_ok());
        assert!(limiter.check(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_evicts_stale_entries() {
        let limiter: RateLimiter<Uuid> = RateLimiter::new(Duration::from_millis(10));
        let key = Uuid::new_v4();
        limiter.check(key).await.ok();
        tokio::time::sleep(Duration::from_millis(150)).await;
        limiter.cleanup().await;
        assert_eq!(limiter.last_action.read().await.len(), 0);
    }
}
