//! Process-local identity store for dev runs and tests.
//!
//! Enforces the same uniqueness constraints as the PostgreSQL schema and
//! reports violations with the same constraint names.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{
    EventSink, IdentityStore, StoreError, ACCOUNT_EMAIL_CONSTRAINT, ACCOUNT_USERNAME_CONSTRAINT,
    BINDING_CONSTRAINT,
};
use crate::models::{
    Account, AccountToken, AuthenticationBinding, Credential, NewAccount, NewBinding,
    SecurityEvent, TokenPurpose,
};

#[derive(Default)]
struct Tables {
    next_account_id: i64,
    accounts: HashMap<i64, Account>,
    bindings: HashMap<(String, String), AuthenticationBinding>,
    credentials: HashMap<Uuid, Credential>,
    account_tokens: HashMap<String, AccountToken>,
    events: Vec<SecurityEvent>,
}

impl Tables {
    /// Applies `change` to the stored account and bumps `updated_utc`.
    fn modify_account(
        &mut self,
        account_id: i64,
        change: impl FnOnce(&mut Account),
    ) -> Result<Account, StoreError> {
        let stored = self.accounts.get_mut(&account_id).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "Account {} disappeared during update",
                account_id
            ))
        })?;
        change(stored);
        stored.updated_utc = Utc::now();
        Ok(stored.clone())
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("In-memory store mutex poisoned: {}", e)))
    }

    /// Snapshot of every appended security event, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.tables().map(|t| t.events.clone()).unwrap_or_default()
    }

    pub fn account_count(&self) -> usize {
        self.tables().map(|t| t.accounts.len()).unwrap_or_default()
    }

    pub fn binding_count(&self) -> usize {
        self.tables().map(|t| t.bindings.len()).unwrap_or_default()
    }
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.tables().map(|_| ())
    }

    async fn create_account(&self, new: &NewAccount) -> Result<Account, StoreError> {
        let mut t = self.tables()?;
        if t.accounts.values().any(|a| a.email == new.email) {
            return Err(StoreError::Conflict(ACCOUNT_EMAIL_CONSTRAINT.to_string()));
        }
        if t.accounts.values().any(|a| a.username == new.username) {
            return Err(StoreError::Conflict(ACCOUNT_USERNAME_CONSTRAINT.to_string()));
        }

        t.next_account_id += 1;
        let now = Utc::now();
        let account = Account {
            account_id: t.next_account_id,
            account_uuid: new.account_uuid,
            email: new.email.clone(),
            username: new.username.clone(),
            display_name: new.display_name.clone(),
            password_hash: new.password_hash.clone(),
            is_active: true,
            email_verified: new.email_verified,
            created_utc: now,
            updated_utc: now,
        };
        t.accounts.insert(account.account_id, account.clone());
        Ok(account)
    }

    async fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>, StoreError> {
        Ok(self.tables()?.accounts.get(&account_id).cloned())
    }

    async fn find_account_by_uuid(
        &self,
        account_uuid: Uuid,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .tables()?
            .accounts
            .values()
            .find(|a| a.account_uuid == account_uuid)
            .cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .tables()?
            .accounts
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn find_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .tables()?
            .accounts
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn update_display_name(
        &self,
        account_id: i64,
        display_name: &str,
    ) -> Result<Account, StoreError> {
        self.tables()?
            .modify_account(account_id, |a| a.display_name = display_name.to_string())
    }

    async fn set_password_hash(
        &self,
        account_id: i64,
        password_hash: &str,
    ) -> Result<Account, StoreError> {
        self.tables()?
            .modify_account(account_id, |a| a.password_hash = Some(password_hash.to_string()))
    }

    async fn mark_email_verified(&self, account_id: i64) -> Result<Account, StoreError> {
        self.tables()?.modify_account(account_id, |a| a.email_verified = true)
    }

    async fn set_account_active(
        &self,
        account_id: i64,
        active: bool,
    ) -> Result<Account, StoreError> {
        self.tables()?.modify_account(account_id, |a| a.is_active = active)
    }

    async fn delete_account(&self, account_id: i64) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        if t.accounts.remove(&account_id).is_none() {
            return Ok(false);
        }
        t.bindings.retain(|_, b| b.account_id != account_id);
        t.credentials.retain(|_, c| c.account_id != account_id);
        t.account_tokens.retain(|_, tok| tok.account_id != account_id);
        Ok(true)
    }

    async fn create_binding(&self, new: &NewBinding) -> Result<AuthenticationBinding, StoreError> {
        let mut t = self.tables()?;
        if !t.accounts.contains_key(&new.account_id) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Binding references unknown account {}",
                new.account_id
            )));
        }

        let key = (new.provider.clone(), new.provider_subject.clone());
        if t.bindings.contains_key(&key) {
            return Err(StoreError::Conflict(BINDING_CONSTRAINT.to_string()));
        }

        let binding = AuthenticationBinding {
            binding_id: Uuid::new_v4(),
            account_id: new.account_id,
            provider: new.provider.clone(),
            provider_subject: new.provider_subject.clone(),
            provider_email: new.provider_email.clone(),
            created_utc: Utc::now(),
        };
        t.bindings.insert(key, binding.clone());
        Ok(binding)
    }

    async fn find_binding(
        &self,
        provider: &str,
        provider_subject: &str,
    ) -> Result<Option<AuthenticationBinding>, StoreError> {
        Ok(self
            .tables()?
            .bindings
            .get(&(provider.to_string(), provider_subject.to_string()))
            .cloned())
    }

    async fn list_bindings(
        &self,
        account_id: i64,
    ) -> Result<Vec<AuthenticationBinding>, StoreError> {
        let mut list: Vec<AuthenticationBinding> = self
            .tables()?
            .bindings
            .values()
            .filter(|b| b.account_id == account_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(list)
    }

    async fn delete_bindings(&self, account_id: i64, provider: &str) -> Result<u64, StoreError> {
        let mut t = self.tables()?;
        let before = t.bindings.len();
        t.bindings
            .retain(|_, b| !(b.account_id == account_id && b.provider == provider));
        Ok((before - t.bindings.len()) as u64)
    }

    async fn replace_account_token(&self, token: &AccountToken) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if !t.accounts.contains_key(&token.account_id) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Token references unknown account {}",
                token.account_id
            )));
        }
        t.account_tokens
            .retain(|_, tok| tok.account_id != token.account_id || tok.purpose != token.purpose);
        t.account_tokens.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn take_account_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
    ) -> Result<Option<AccountToken>, StoreError> {
        let mut t = self.tables()?;
        let matches = t
            .account_tokens
            .get(token_hash)
            .is_some_and(|tok| tok.purpose == purpose.as_str());
        Ok(if matches {
            t.account_tokens.remove(token_hash)
        } else {
            None
        })
    }

    async fn create_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if !t.accounts.contains_key(&credential.account_id) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "Credential references unknown account {}",
                credential.account_id
            )));
        }
        t.credentials
            .insert(credential.credential_uuid, credential.clone());
        Ok(())
    }

    async fn list_credentials(&self, account_id: i64) -> Result<Vec<Credential>, StoreError> {
        let mut list: Vec<Credential> = self
            .tables()?
            .credentials
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(list)
    }

    async fn find_credential(
        &self,
        credential_uuid: Uuid,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(self.tables()?.credentials.get(&credential_uuid).cloned())
    }

    async fn find_credentials_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<Credential>, StoreError> {
        let mut list: Vec<Credential> = self
            .tables()?
            .credentials
            .values()
            .filter(|c| c.username == username)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(list)
    }

    async fn update_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if let Some(stored) = t.credentials.get_mut(&credential.credential_uuid) {
            stored.label = credential.label.clone();
            stored.expires_utc = credential.expires_utc;
            stored.revoked_utc = credential.revoked_utc;
        }
        Ok(())
    }

    async fn touch_credential(
        &self,
        credential_uuid: Uuid,
        used_utc: DateTime<Utc>,
        source_ip: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if let Some(stored) = t.credentials.get_mut(&credential_uuid) {
            stored.last_used_utc = Some(used_utc);
            stored.last_used_ip = source_ip.map(str::to_string);
        }
        Ok(())
    }

    async fn delete_credential(&self, credential_uuid: Uuid) -> Result<bool, StoreError> {
        Ok(self.tables()?.credentials.remove(&credential_uuid).is_some())
    }
}

#[async_trait]
impl EventSink for InMemoryStore {
    async fn append(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.tables()?.events.push(event.clone());
        Ok(())
    }
}
