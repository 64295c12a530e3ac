use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use uuid::Uuid;

use super::revocation::RevocationStore;
use super::throttle::{CounterStore, WindowCount};

/// INCR, start the window on the first hit, and repair a key that lost its TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    increment: Script,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn epoch_key(account_uuid: Uuid) -> String {
        format!("session_epoch:{}", account_uuid)
    }
}

#[async_trait]
impl RevocationStore for RedisService {
    async fn consume_once(&self, jti: &str, ttl_seconds: u64) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("refresh_consumed:{}", jti);

        // SET NX replies OK when the key was created and nil when it already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to consume refresh token id: {}", e))?;

        Ok(reply.is_some())
    }

    async fn revoke_family(&self, family: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("refresh_family_revoked:{}", family);

        redis::cmd("SET")
            .arg(&key)
            .arg("revoked")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to revoke token family: {}", e))
    }

    async fn is_family_revoked(&self, family: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = format!("refresh_family_revoked:{}", family);

        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check token family: {}", e))?;

        Ok(exists)
    }

    async fn session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let epoch: Option<u64> = redis::cmd("GET")
            .arg(Self::epoch_key(account_uuid))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read session epoch: {}", e))?;

        Ok(epoch.unwrap_or(0))
    }

    async fn bump_session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("INCR")
            .arg(Self::epoch_key(account_uuid))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bump session epoch: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

#[async_trait]
impl CounterStore for RedisService {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, anyhow::Error> {
        let mut conn = self.manager.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let (count, ttl_ms): (u64, i64) = self
            .increment
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to increment counter: {}", e))?;

        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reset counter: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    async fn connect() -> RedisService {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisService::new(&RedisConfig { url }).await.expect("redis")
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn consume_once_is_atomic() {
        let redis = connect().await;
        let jti = Uuid::new_v4().to_string();
        assert!(redis.consume_once(&jti, 30).await.unwrap());
        assert!(!redis.consume_once(&jti, 30).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn increment_opens_window_once() {
        let redis = connect().await;
        let key = format!("throttle:test:{}", Uuid::new_v4());
        let first = redis.increment(&key, Duration::from_secs(60)).await.unwrap();
        let second = redis.increment(&key, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.resets_in <= Duration::from_secs(60));
        redis.reset(&key).await.unwrap();
    }
}
