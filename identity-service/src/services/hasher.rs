//! Secret hashing behind a swappable capability.
//!
//! Argon2 is memory-hard and slow on purpose, so the work runs on the
//! blocking pool instead of a runtime worker.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::HashingConfig;

#[async_trait]
pub trait SecretHasher: Send + Sync {
    /// Hashes a password or credential secret into a self-describing PHC string.
    async fn hash(&self, secret: &str) -> Result<String, anyhow::Error>;

    /// Constant-time comparison of `secret` against a stored hash.
    async fn verify(&self, secret: &str, hash: &str) -> Result<bool, anyhow::Error>;

    /// Burns one verification's worth of work so misses cost the same as hits.
    async fn dummy_verify(&self, secret: &str);
}

#[derive(Clone)]
pub struct Argon2Hasher {
    params: Params,
    dummy_hash: Arc<str>,
}

fn argon2(params: Params) -> Argon2<'static> {
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

fn hash_blocking(params: Params, secret: &[u8]) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    argon2(params)
        .hash_password(secret, &salt)
        .map(|h| h.to_string())
        .map_err(|e| anyhow::anyhow!("Secret hashing failed: {}", e))
}

fn verify_blocking(params: Params, secret: &[u8], hash: &str) -> Result<bool, anyhow::Error> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid stored hash: {}", e))?;

    // Parameters come from the stored hash, so hashes made under older
    // cost settings keep verifying.
    Ok(argon2(params).verify_password(secret, &parsed).is_ok())
}

impl Argon2Hasher {
    pub fn new(config: &HashingConfig) -> Result<Self, anyhow::Error> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| anyhow::anyhow!("Invalid Argon2 parameters: {}", e))?;

        let dummy_hash = hash_blocking(params.clone(), b"dummy-secret-for-timing")
            .map_err(|e| anyhow::anyhow!("Failed to prepare dummy hash: {}", e))?;

        Ok(Self {
            params,
            dummy_hash: dummy_hash.into(),
        })
    }

    async fn run_verify(&self, secret: &str, hash: Arc<str>) -> Result<bool, anyhow::Error> {
        let params = self.params.clone();
        let secret = secret.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || verify_blocking(params, &secret, &hash))
            .await
            .map_err(|e| anyhow::anyhow!("Verification task failed: {}", e))?
    }
}

#[async_trait]
impl SecretHasher for Argon2Hasher {
    async fn hash(&self, secret: &str) -> Result<String, anyhow::Error> {
        let params = self.params.clone();
        let secret = secret.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || hash_blocking(params, &secret))
            .await
            .map_err(|e| anyhow::anyhow!("Hashing task failed: {}", e))?
    }

    async fn verify(&self, secret: &str, hash: &str) -> Result<bool, anyhow::Error> {
        self.run_verify(secret, Arc::from(hash)).await
    }

    async fn dummy_verify(&self, secret: &str) {
        let _ = self.run_verify(secret, self.dummy_hash.clone()).await;
    }
}
