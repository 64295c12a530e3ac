//! Single-use tokens mailed to the account owner: email verification and
//! password reset links. Only the SHA-256 of the token is stored.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    EmailVerification,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::EmailVerification => "email_verification",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }
}

impl FromStr for TokenPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_verification" => Ok(TokenPurpose::EmailVerification),
            "password_reset" => Ok(TokenPurpose::PasswordReset),
            _ => Err(format!("Invalid token purpose: {}", s)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountToken {
    pub token_hash: String,
    pub account_id: i64,
    pub purpose: String,
    pub expires_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

impl AccountToken {
    pub fn new(account_id: i64, token_hash: String, purpose: TokenPurpose, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token_hash,
            account_id,
            purpose: purpose.as_str().to_string(),
            expires_utc: now + ttl,
            created_utc: now,
        }
    }

    /// Stored form of a raw token.
    pub fn digest(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_round_trips_through_its_column_value() {
        for purpose in [TokenPurpose::EmailVerification, TokenPurpose::PasswordReset] {
            assert_eq!(purpose.as_str().parse::<TokenPurpose>().unwrap(), purpose);
        }
        assert!("invite".parse::<TokenPurpose>().is_err());
    }

    #[test]
    fn digest_is_hex_sha256_and_case_sensitive() {
        let digest = AccountToken::digest("AbC");
        assert_eq!(digest.len(), 64);
        assert_ne!(digest, AccountToken::digest("abc"));
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let token = AccountToken::new(
            1,
            "hash".to_string(),
            TokenPurpose::PasswordReset,
            Duration::hours(1),
        );
        assert!(!token.is_expired_at(token.created_utc));
        assert!(token.is_expired_at(token.created_utc + Duration::hours(1)));
    }
}
