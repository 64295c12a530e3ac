//! Persistence contract for accounts, bindings, credentials and security events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Account, AccountToken, AuthenticationBinding, Credential, NewAccount, NewBinding,
    SecurityEvent, TokenPurpose,
};

pub const ACCOUNT_EMAIL_CONSTRAINT: &str = "accounts_email_key";
pub const ACCOUNT_USERNAME_CONSTRAINT: &str = "accounts_username_key";
pub const BINDING_CONSTRAINT: &str = "bindings_provider_subject_key";

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Carries the constraint name.
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict_on(&self, constraint: &str) -> bool {
        matches!(self, StoreError::Conflict(c) if c == constraint)
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // Accounts
    async fn create_account(&self, new: &NewAccount) -> Result<Account, StoreError>;
    async fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>, StoreError>;
    async fn find_account_by_uuid(&self, account_uuid: Uuid)
        -> Result<Option<Account>, StoreError>;
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError>;
    async fn find_account_by_username(&self, username: &str)
        -> Result<Option<Account>, StoreError>;

    // Each update touches only its own columns (plus `updated_utc`), so
    // concurrent updates from stale snapshots cannot undo each other.
    async fn update_display_name(
        &self,
        account_id: i64,
        display_name: &str,
    ) -> Result<Account, StoreError>;
    async fn set_password_hash(
        &self,
        account_id: i64,
        password_hash: &str,
    ) -> Result<Account, StoreError>;
    async fn mark_email_verified(&self, account_id: i64) -> Result<Account, StoreError>;
    async fn set_account_active(&self, account_id: i64, active: bool)
        -> Result<Account, StoreError>;
    /// Deletes the account together with its bindings and credentials.
    async fn delete_account(&self, account_id: i64) -> Result<bool, StoreError>;

    // Bindings
    async fn create_binding(&self, new: &NewBinding) -> Result<AuthenticationBinding, StoreError>;
    async fn find_binding(
        &self,
        provider: &str,
        provider_subject: &str,
    ) -> Result<Option<AuthenticationBinding>, StoreError>;
    /// Oldest first.
    async fn list_bindings(&self, account_id: i64)
        -> Result<Vec<AuthenticationBinding>, StoreError>;
    /// Removes every binding the account holds for `provider`. Returns the count.
    async fn delete_bindings(&self, account_id: i64, provider: &str) -> Result<u64, StoreError>;

    // Mailed tokens
    /// Stores `token`, dropping any earlier token with the same account and purpose.
    async fn replace_account_token(&self, token: &AccountToken) -> Result<(), StoreError>;
    /// Deletes and returns the token in one step, so a token is redeemed at most once.
    async fn take_account_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
    ) -> Result<Option<AccountToken>, StoreError>;

    // Credentials
    async fn create_credential(&self, credential: &Credential) -> Result<(), StoreError>;
    /// Newest first, revoked included.
    async fn list_credentials(&self, account_id: i64) -> Result<Vec<Credential>, StoreError>;
    async fn find_credential(&self, credential_uuid: Uuid)
        -> Result<Option<Credential>, StoreError>;
    async fn find_credentials_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<Credential>, StoreError>;
    /// Persists label, expiry and revocation.
    async fn update_credential(&self, credential: &Credential) -> Result<(), StoreError>;
    /// Writes only the last-used fields so it never races a revocation.
    async fn touch_credential(
        &self,
        credential_uuid: Uuid,
        used_utc: DateTime<Utc>,
        source_ip: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn delete_credential(&self, credential_uuid: Uuid) -> Result<bool, StoreError>;
}

/// Append-only destination for security events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &SecurityEvent) -> Result<(), StoreError>;
}
