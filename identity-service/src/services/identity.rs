//! Finds or provisions the local account behind a verified identity.
//!
//! No in-process locking: the unique constraints on account email and on
//! `(provider, provider_subject)` arbitrate concurrent first logins. A writer
//! that loses a race re-reads the winning row and carries on.
//!
//! A new subject is linked into an existing account only when that
//! account's email is verified; otherwise whoever registered the address
//! first, without proving ownership, would inherit the federated identity.

use std::sync::Arc;
use uuid::Uuid;

use super::attributes::CanonicalIdentity;
use super::error::ServiceError;
use super::store::{IdentityStore, StoreError, ACCOUNT_EMAIL_CONSTRAINT, ACCOUNT_USERNAME_CONSTRAINT};
use crate::models::{Account, NewAccount, NewBinding};
use crate::utils::generate_username;

const RESOLVE_ROUNDS: usize = 3;
const USERNAME_ATTEMPTS: usize = 10;

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self, identity), fields(subject = %identity.subject))]
    pub async fn resolve(
        &self,
        provider: &str,
        identity: &CanonicalIdentity,
    ) -> Result<Account, ServiceError> {
        for round in 0..RESOLVE_ROUNDS {
            if let Some(binding) = self
                .store
                .find_binding(provider, &identity.subject)
                .await?
            {
                let account = self
                    .store
                    .find_account_by_id(binding.account_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Internal(anyhow::anyhow!(
                            "Binding {} points at a missing account",
                            binding.binding_id
                        ))
                    })?;
                return ensure_active(account);
            }

            let account = match self.store.find_account_by_email(&identity.email).await? {
                Some(existing) if !existing.email_verified => {
                    tracing::warn!(
                        account_id = existing.account_id,
                        "Refusing to link provider into unverified account"
                    );
                    return Err(ServiceError::EmailNotVerified);
                }
                Some(existing) => existing,
                None => match self
                    .provision_account(&identity.email, &identity.display_name, None, true)
                    .await
                {
                    Ok(created) => {
                        tracing::info!(account_id = created.account_id, "Provisioned account");
                        created
                    }
                    Err(ServiceError::EmailAlreadyRegistered) => {
                        tracing::debug!(round, "Lost account creation race, re-reading");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let binding = NewBinding {
                account_id: account.account_id,
                provider: provider.to_string(),
                provider_subject: identity.subject.clone(),
                provider_email: Some(identity.email.clone()),
            };
            match self.store.create_binding(&binding).await {
                Ok(_) => {
                    tracing::info!(account_id = account.account_id, "Bound provider subject");
                    return ensure_active(account);
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(round, "Lost binding race, re-reading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Internal(anyhow::anyhow!(
            "Identity resolution did not settle after {} rounds",
            RESOLVE_ROUNDS
        )))
    }

    /// Creates an account with a fresh random username. Fails with
    /// `EmailAlreadyRegistered` if the email is taken.
    pub async fn provision_account(
        &self,
        email: &str,
        display_name: &str,
        password_hash: Option<String>,
        email_verified: bool,
    ) -> Result<Account, ServiceError> {
        for _ in 0..USERNAME_ATTEMPTS {
            let new = NewAccount {
                account_uuid: Uuid::new_v4(),
                email: email.to_string(),
                username: generate_username(),
                display_name: display_name.to_string(),
                password_hash: password_hash.clone(),
                email_verified,
            };

            match self.store.create_account(&new).await {
                Ok(account) => return Ok(account),
                Err(e) if e.is_conflict_on(ACCOUNT_EMAIL_CONSTRAINT) => {
                    return Err(ServiceError::EmailAlreadyRegistered)
                }
                Err(e) if e.is_conflict_on(ACCOUNT_USERNAME_CONSTRAINT) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Internal(anyhow::anyhow!(
            "Could not allocate a unique username"
        )))
    }
}

fn ensure_active(account: Account) -> Result<Account, ServiceError> {
    if account.is_active {
        Ok(account)
    } else {
        Err(ServiceError::AccountInactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::InMemoryStore;

    fn identity(subject: &str, email: &str) -> CanonicalIdentity {
        CanonicalIdentity {
            subject: subject.to_string(),
            email: email.to_string(),
            display_name: "Alice".to_string(),
        }
    }

    #[tokio::test]
    async fn first_login_provisions_verified_account() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());

        let account = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap();
        assert!(account.email_verified);
        assert!(!account.has_password());
        assert_eq!(store.account_count(), 1);
        assert_eq!(store.binding_count(), 1);
    }

    #[tokio::test]
    async fn verified_local_account_gets_bound() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());
        let local = resolver
            .provision_account("alice@example.com", "Alice", Some("hash".into()), true)
            .await
            .unwrap();

        let resolved = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(resolved.account_id, local.account_id);
        assert_eq!(resolved.password_hash.as_deref(), Some("hash"));
        assert_eq!(store.account_count(), 1);
    }

    #[tokio::test]
    async fn unverified_local_account_is_not_bound() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());
        let local = resolver
            .provision_account("alice@example.com", "Mallory", Some("hash".into()), false)
            .await
            .unwrap();

        let err = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmailNotVerified));
        assert_eq!(store.binding_count(), 0);

        store.mark_email_verified(local.account_id).await.unwrap();
        let resolved = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(resolved.account_id, local.account_id);
    }

    #[tokio::test]
    async fn bound_subject_ignores_changed_email() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());
        let first = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap();
        let second = resolver
            .resolve("corp-sso", &identity("S1", "alice.new@example.com"))
            .await
            .unwrap();
        assert_eq!(first.account_id, second.account_id);
        assert_eq!(store.account_count(), 1);
    }

    #[tokio::test]
    async fn one_account_can_hold_several_providers() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store.clone());
        let a = resolver
            .resolve("corp-sso", &identity("S1", "alice@example.com"))
            .await
            .unwrap();
        let b = resolver
            .resolve("partner-idp", &identity("P-77", "alice@example.com"))
            .await
            .unwrap();
        assert_eq!(a.account_id, b.account_id);
        assert_eq!(store.binding_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_email_registration_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = IdentityResolver::new(store);
        resolver
            .provision_account("bob@example.com", "Bob", None, false)
            .await
            .unwrap();
        let err = resolver
            .provision_account("bob@example.com", "Bob", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmailAlreadyRegistered));
    }
}
