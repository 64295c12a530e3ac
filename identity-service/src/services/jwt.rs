use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::revocation::RevocationStore;
use crate::config::JwtConfig;
use crate::models::Account;

const MIN_SECRET_BYTES: usize = 32;
const CLOCK_LEEWAY_SECONDS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims shared by access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Account UUID
    pub sub: String,
    pub email: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique token id. For refresh tokens this is the replay key.
    pub jti: String,
    pub typ: TokenKind,
    /// Refresh-token family; every rotation of one login shares it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fam: Option<String>,
    /// Session epoch of the account when the token was minted.
    #[serde(default)]
    pub sep: u64,
}

impl TokenClaims {
    pub fn account_uuid(&self) -> Result<Uuid, ServiceError> {
        Uuid::parse_str(&self.sub).map_err(|_| ServiceError::TokenInvalid)
    }

    fn remaining_seconds(&self) -> u64 {
        (self.exp - Utc::now().timestamp()).max(1) as u64
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
}

/// Mints, verifies and rotates session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    revocations: Arc<dyn RevocationStore>,
}

impl TokenIssuer {
    /// Loads the signing key. Fails if no usable key is configured; the
    /// service must not start without one.
    pub fn new(
        config: &JwtConfig,
        revocations: Arc<dyn RevocationStore>,
    ) -> Result<Self, anyhow::Error> {
        let (encoding_key, decoding_key, algorithm) =
            match (&config.private_key_path, &config.public_key_path, &config.secret) {
                (Some(private_path), Some(public_path), _) => {
                    let private_pem = fs::read_to_string(private_path).map_err(|e| {
                        anyhow::anyhow!("Failed to read private key from {}: {}", private_path, e)
                    })?;
                    let public_pem = fs::read_to_string(public_path).map_err(|e| {
                        anyhow::anyhow!("Failed to read public key from {}: {}", public_path, e)
                    })?;

                    let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
                    let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                    tracing::info!("Token issuer initialized with RS256 keys");
                    (encoding, decoding, Algorithm::RS256)
                }
                (_, _, Some(secret)) => {
                    let bytes = secret.expose_secret().as_bytes();
                    if bytes.len() < MIN_SECRET_BYTES {
                        anyhow::bail!(
                            "JWT secret must be at least {} bytes",
                            MIN_SECRET_BYTES
                        );
                    }
                    tracing::info!("Token issuer initialized with HS256 secret");
                    (
                        EncodingKey::from_secret(bytes),
                        DecodingKey::from_secret(bytes),
                        Algorithm::HS256,
                    )
                }
                _ => anyhow::bail!("No JWT signing key configured"),
            };

        let access_ttl = Duration::minutes(config.access_token_expiry_minutes);
        let refresh_ttl = Duration::days(config.refresh_token_expiry_days);
        if access_ttl <= Duration::zero() || access_ttl >= refresh_ttl {
            anyhow::bail!("Access token lifetime must be positive and shorter than refresh lifetime");
        }

        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm,
            issuer: config.issuer.clone(),
            access_ttl,
            refresh_ttl,
            revocations,
        })
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, ServiceError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode token: {}", e)))
    }

    fn decode(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, ServiceError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = CLOCK_LEEWAY_SECONDS;
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ServiceError::TokenExpired,
                _ => {
                    tracing::debug!(error = %e, "Token rejected");
                    ServiceError::TokenInvalid
                }
            })?
            .claims;

        if claims.typ != expected {
            tracing::debug!(?expected, actual = ?claims.typ, "Token kind mismatch");
            return Err(ServiceError::TokenInvalid);
        }
        Ok(claims)
    }

    fn mint_pair(
        &self,
        sub: &str,
        email: &str,
        family: &str,
        epoch: u64,
    ) -> Result<TokenPair, ServiceError> {
        let now = Utc::now();
        let access_exp = now + self.access_ttl;
        let refresh_exp = now + self.refresh_ttl;

        let access = TokenClaims {
            sub: sub.to_string(),
            email: email.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: TokenKind::Access,
            fam: None,
            sep: epoch,
        };
        let refresh = TokenClaims {
            exp: refresh_exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: TokenKind::Refresh,
            fam: Some(family.to_string()),
            ..access.clone()
        };

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            expires_in: self.access_ttl.num_seconds(),
            expires_at: access_exp,
        })
    }

    /// Starts a new token family for a fresh login.
    pub async fn issue_pair(&self, account: &Account) -> Result<TokenPair, ServiceError> {
        let epoch = self
            .revocations
            .session_epoch(account.account_uuid)
            .await
            .map_err(ServiceError::Internal)?;
        let family = Uuid::new_v4().to_string();
        self.mint_pair(
            &account.account_uuid.to_string(),
            &account.email,
            &family,
            epoch,
        )
    }

    /// Verifies an access token. Pure; no I/O.
    pub fn verify(&self, access_token: &str) -> Result<TokenClaims, ServiceError> {
        self.decode(access_token, TokenKind::Access)
    }

    /// Rejects tokens minted before the account's last session reset.
    pub async fn ensure_current_session(&self, claims: &TokenClaims) -> Result<(), ServiceError> {
        let current = self
            .revocations
            .session_epoch(claims.account_uuid()?)
            .await
            .map_err(ServiceError::Internal)?;
        if claims.sep < current {
            tracing::debug!(jti = %claims.jti, "Token predates session reset");
            return Err(ServiceError::TokenInvalid);
        }
        Ok(())
    }

    /// Redeems a refresh token for a new pair in the same family.
    ///
    /// A second redemption of the same token is a replay: the whole family
    /// is revoked and the caller must log in again.
    pub async fn rotate(&self, refresh_token: &str) -> Result<(TokenClaims, TokenPair), ServiceError> {
        let claims = self.decode(refresh_token, TokenKind::Refresh)?;
        let family = claims.fam.clone().ok_or(ServiceError::TokenInvalid)?;

        if self
            .revocations
            .is_family_revoked(&family)
            .await
            .map_err(ServiceError::Internal)?
        {
            tracing::debug!(family = %family, "Refresh token family revoked");
            return Err(ServiceError::TokenInvalid);
        }

        self.ensure_current_session(&claims).await?;

        let first_use = self
            .revocations
            .consume_once(&claims.jti, claims.remaining_seconds())
            .await
            .map_err(ServiceError::Internal)?;
        if !first_use {
            tracing::warn!(
                family = %family,
                account = %claims.sub,
                "Refresh token replay detected, revoking family"
            );
            self.revocations
                .revoke_family(&family, self.refresh_ttl.num_seconds().max(1) as u64)
                .await
                .map_err(ServiceError::Internal)?;
            return Err(ServiceError::TokenReplayed);
        }

        let pair = self.mint_pair(&claims.sub, &claims.email, &family, claims.sep)?;
        Ok((claims, pair))
    }

    /// Revokes the family of a presented refresh token (logout).
    pub async fn revoke(&self, refresh_token: &str) -> Result<TokenClaims, ServiceError> {
        let claims = self.decode(refresh_token, TokenKind::Refresh)?;
        let family = claims.fam.as_deref().ok_or(ServiceError::TokenInvalid)?;
        self.revocations
            .revoke_family(family, self.refresh_ttl.num_seconds().max(1) as u64)
            .await
            .map_err(ServiceError::Internal)?;
        Ok(claims)
    }

    /// Invalidates every outstanding token of the account.
    pub async fn revoke_all_sessions(&self, account_uuid: Uuid) -> Result<(), ServiceError> {
        let epoch = self
            .revocations
            .bump_session_epoch(account_uuid)
            .await
            .map_err(ServiceError::Internal)?;
        tracing::info!(account = %account_uuid, epoch, "All sessions revoked");
        Ok(())
    }
}
