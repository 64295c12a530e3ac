//! Refresh-token revocation set and per-account session epochs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Atomically marks `jti` consumed. Returns `false` if it was already consumed.
    async fn consume_once(&self, jti: &str, ttl_seconds: u64) -> Result<bool, anyhow::Error>;

    async fn revoke_family(&self, family: &str, ttl_seconds: u64) -> Result<(), anyhow::Error>;

    async fn is_family_revoked(&self, family: &str) -> Result<bool, anyhow::Error>;

    /// Tokens minted with an older epoch are no longer honoured.
    async fn session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error>;

    async fn bump_session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

/// Process-local revocation set.
#[derive(Default)]
pub struct MemoryRevocationStore {
    consumed: DashMap<String, Instant>,
    families: DashMap<String, Instant>,
    epochs: DashMap<Uuid, u64>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(map: &DashMap<String, Instant>, key: &str, now: Instant) -> bool {
        map.get(key).is_some_and(|expires_at| *expires_at > now)
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn consume_once(&self, jti: &str, ttl_seconds: u64) -> Result<bool, anyhow::Error> {
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(ttl_seconds);

        // The entry guard holds the shard lock, so check-and-insert is atomic.
        let mut entry = self.consumed.entry(jti.to_string()).or_insert(now);
        if *entry > now {
            return Ok(false);
        }
        *entry = expires_at;
        drop(entry);

        self.consumed.retain(|_, exp| *exp > now);
        Ok(true)
    }

    async fn revoke_family(&self, family: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let now = Instant::now();
        self.families
            .insert(family.to_string(), now + Duration::from_secs(ttl_seconds));
        self.families.retain(|_, exp| *exp > now);
        Ok(())
    }

    async fn is_family_revoked(&self, family: &str) -> Result<bool, anyhow::Error> {
        Ok(Self::live(&self.families, family, Instant::now()))
    }

    async fn session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error> {
        Ok(self.epochs.get(&account_uuid).map(|e| *e).unwrap_or(0))
    }

    async fn bump_session_epoch(&self, account_uuid: Uuid) -> Result<u64, anyhow::Error> {
        let mut epoch = self.epochs.entry(account_uuid).or_insert(0);
        *epoch += 1;
        Ok(*epoch)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
