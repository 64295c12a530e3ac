//! Protocol credentials ("app passwords") for clients that cannot do SSO.
//!
//! Verification runs on every protocol request. It is read-only apart from
//! the usage stamp, which is written on a detached task and may be lost.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::hasher::SecretHasher;
use super::metrics::record_auth_attempt;
use super::security_audit::SecurityEventRecorder;
use super::store::IdentityStore;
use super::throttle::{subject_key, LoginThrottle};
use crate::models::{
    Account, ClientContext, Credential, CredentialScope, CredentialStatus, SecurityEvent,
    SecurityEventKind,
};
use crate::utils::{generate_secret, is_valid_protocol_username};

const MAX_LABEL_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub label: String,
    pub scope: CredentialScope,
    /// Protocol username. Defaults to the account's username.
    pub username: Option<String>,
    pub expires_utc: Option<DateTime<Utc>>,
}

/// A freshly created credential. `secret` is the only copy of the plaintext.
pub struct IssuedCredential {
    pub credential: Credential,
    pub secret: SecretString,
}

#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    pub account: Account,
    pub credential: Credential,
    pub scope: CredentialScope,
}

#[derive(Clone)]
pub struct CredentialManager {
    store: Arc<dyn IdentityStore>,
    hasher: Arc<dyn SecretHasher>,
    throttle: LoginThrottle,
    events: SecurityEventRecorder,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: Arc<dyn SecretHasher>,
        throttle: LoginThrottle,
        events: SecurityEventRecorder,
    ) -> Self {
        Self {
            store,
            hasher,
            throttle,
            events,
        }
    }

    #[tracing::instrument(skip(self, account, request, ctx), fields(account_id = account.account_id))]
    pub async fn create(
        &self,
        account: &Account,
        request: NewCredential,
        ctx: &ClientContext,
    ) -> Result<IssuedCredential, ServiceError> {
        let label = request.label.trim().to_string();
        let label_len = label.chars().count();
        if label_len == 0 || label_len > MAX_LABEL_CHARS {
            return Err(ServiceError::Validation(format!(
                "Label must be 1-{} characters",
                MAX_LABEL_CHARS
            )));
        }

        if let Some(expires) = request.expires_utc {
            if expires <= Utc::now() {
                return Err(ServiceError::Validation(
                    "Expiry must be in the future".to_string(),
                ));
            }
        }

        let username = match request.username {
            Some(u) => u.trim().to_string(),
            None => account.username.clone(),
        };
        if !is_valid_protocol_username(&username) {
            return Err(ServiceError::Validation(
                "Username must be 3-50 characters of letters, digits, '_' or '-'".to_string(),
            ));
        }
        self.ensure_username_available(account, &username).await?;

        let secret = generate_secret();
        let secret_hash = self
            .hasher
            .hash(&secret)
            .await
            .map_err(ServiceError::Internal)?;

        let credential = Credential::new(
            account.account_id,
            label,
            username,
            secret_hash,
            request.scope,
            request.expires_utc,
        );
        self.store.create_credential(&credential).await?;

        tracing::info!(credential_id = %credential.credential_uuid, scope = %request.scope, "Credential created");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::CredentialCreated)
                .account(account.account_id)
                .client(ctx)
                .detail(format!(
                    "credential={} scope={}",
                    credential.credential_uuid, request.scope
                )),
        );

        Ok(IssuedCredential {
            credential,
            secret: SecretString::new(secret),
        })
    }

    /// A protocol username may only be shared among one account's credentials,
    /// and may not be another account's login name.
    async fn ensure_username_available(
        &self,
        account: &Account,
        username: &str,
    ) -> Result<(), ServiceError> {
        if let Some(holder) = self.store.find_account_by_username(username).await? {
            if holder.account_id != account.account_id {
                return Err(ServiceError::Validation(
                    "Username is not available".to_string(),
                ));
            }
        }
        let taken = self
            .store
            .find_credentials_by_username(username)
            .await?
            .iter()
            .any(|c| !c.is_owned_by(account.account_id));
        if taken {
            return Err(ServiceError::Validation(
                "Username is not available".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn list(&self, account: &Account) -> Result<Vec<Credential>, ServiceError> {
        Ok(self.store.list_credentials(account.account_id).await?)
    }

    /// Checks a presented username/secret pair.
    ///
    /// Live candidates are compared first. When none match, dead candidates
    /// decide whether the failure is reported internally as expired or
    /// revoked; revocation outranks expiry.
    pub async fn verify(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<VerifiedCredential, ServiceError> {
        let candidates = self.store.find_credentials_by_username(username).await?;
        if candidates.is_empty() {
            self.hasher.dummy_verify(secret).await;
            return Err(ServiceError::CredentialNotFound);
        }

        let now = Utc::now();
        let (live, dead): (Vec<Credential>, Vec<Credential>) = candidates
            .into_iter()
            .partition(|c| c.status_at(now) == CredentialStatus::Active);

        for credential in &live {
            if self.matches(secret, credential).await {
                let account = self
                    .store
                    .find_account_by_id(credential.account_id)
                    .await?
                    .ok_or(ServiceError::CredentialNotFound)?;
                if !account.is_active {
                    return Err(ServiceError::AccountInactive);
                }
                return Ok(VerifiedCredential {
                    scope: credential.scope(),
                    account,
                    credential: credential.clone(),
                });
            }
        }

        let mut matched_dead = None;
        for credential in &dead {
            if self.matches(secret, credential).await {
                let status = credential.status_at(now);
                matched_dead = Some(status);
                if status == CredentialStatus::Revoked {
                    break;
                }
            }
        }

        Err(match matched_dead {
            Some(CredentialStatus::Revoked) => ServiceError::CredentialRevoked,
            Some(_) => ServiceError::CredentialExpired,
            None if live.is_empty() => {
                if dead.iter().any(|c| c.revoked_utc.is_some()) {
                    ServiceError::CredentialRevoked
                } else {
                    ServiceError::CredentialExpired
                }
            }
            None => ServiceError::CredentialNotFound,
        })
    }

    async fn matches(&self, secret: &str, credential: &Credential) -> bool {
        match self.hasher.verify(secret, &credential.secret_hash).await {
            Ok(matched) => matched,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    credential_id = %credential.credential_uuid,
                    "Stored credential hash is unreadable"
                );
                false
            }
        }
    }

    /// Full protocol authentication: throttle, verify, record, stamp usage.
    pub async fn authenticate(
        &self,
        username: &str,
        secret: &str,
        ctx: &ClientContext,
    ) -> Result<VerifiedCredential, ServiceError> {
        let ip_key = format!("ip:{}", ctx.ip_key());
        let user_key = format!("user:{}", subject_key(username));

        for key in [&ip_key, &user_key] {
            if let Err(e) = self.throttle.guard(key).await {
                record_auth_attempt("credential", "throttled");
                self.events.record(
                    SecurityEvent::failed(SecurityEventKind::LoginThrottled)
                        .subject(username)
                        .client(ctx)
                        .detail("protocol"),
                );
                return Err(e);
            }
        }

        match self.verify(username, secret).await {
            Ok(verified) => {
                self.throttle.reset(&ip_key).await;
                self.throttle.reset(&user_key).await;
                record_auth_attempt("credential", "success");
                self.events.record(
                    SecurityEvent::succeeded(SecurityEventKind::CredentialAuthSucceeded)
                        .account(verified.account.account_id)
                        .client(ctx)
                        .detail(format!("credential={}", verified.credential.credential_uuid)),
                );
                self.touch_usage(verified.credential.credential_uuid, ctx);
                Ok(verified)
            }
            Err(e) => {
                record_auth_attempt("credential", "failure");
                self.events.record(
                    SecurityEvent::failed(SecurityEventKind::CredentialAuthFailed)
                        .subject(username)
                        .client(ctx)
                        .detail(e.reason()),
                );
                Err(e)
            }
        }
    }

    /// Revokes a credential owned by `owner`. Revoking twice is a no-op.
    pub async fn revoke(
        &self,
        credential_id: Uuid,
        owner: &Account,
        ctx: &ClientContext,
    ) -> Result<Credential, ServiceError> {
        let mut credential = self.owned_credential(credential_id, owner, ctx).await?;
        if credential.revoked_utc.is_some() {
            return Ok(credential);
        }

        credential.revoked_utc = Some(Utc::now());
        self.store.update_credential(&credential).await?;

        tracing::info!(credential_id = %credential_id, "Credential revoked");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::CredentialRevoked)
                .account(owner.account_id)
                .client(ctx)
                .detail(format!("credential={}", credential_id)),
        );
        Ok(credential)
    }

    /// Deletes a credential that can no longer authenticate.
    pub async fn remove(
        &self,
        credential_id: Uuid,
        owner: &Account,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        let credential = self.owned_credential(credential_id, owner, ctx).await?;
        if credential.status_at(Utc::now()) == CredentialStatus::Active {
            return Err(ServiceError::Validation(
                "Revoke the credential before removing it".to_string(),
            ));
        }

        self.store.delete_credential(credential_id).await?;
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::CredentialRemoved)
                .account(owner.account_id)
                .client(ctx)
                .detail(format!("credential={}", credential_id)),
        );
        Ok(())
    }

    async fn owned_credential(
        &self,
        credential_id: Uuid,
        owner: &Account,
        ctx: &ClientContext,
    ) -> Result<Credential, ServiceError> {
        let credential = self
            .store
            .find_credential(credential_id)
            .await?
            .ok_or(ServiceError::CredentialNotFound)?;

        if !credential.is_owned_by(owner.account_id) {
            self.events.record(
                SecurityEvent::failed(SecurityEventKind::CredentialOwnershipDenied)
                    .account(owner.account_id)
                    .client(ctx)
                    .detail(format!("credential={}", credential_id)),
            );
            return Err(ServiceError::NotOwner);
        }
        Ok(credential)
    }

    /// Best-effort usage stamp. Never blocks or fails the caller.
    pub fn touch_usage(&self, credential_id: Uuid, ctx: &ClientContext) {
        let store = self.store.clone();
        let source = ctx.ip.map(|ip| ip.to_string());
        tokio::spawn(async move {
            if let Err(e) = store
                .touch_credential(credential_id, Utc::now(), source.as_deref())
                .await
            {
                tracing::warn!(error = %e, credential_id = %credential_id, "Dropped credential usage update");
            }
        });
    }
}
