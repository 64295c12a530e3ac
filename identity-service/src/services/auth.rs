//! Interactive account operations: registration, password login, session
//! refresh, mailed verification and reset links, and the self-service
//! account lifecycle.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::ValidateEmail;

use super::email::EmailSender;
use super::error::ServiceError;
use super::hasher::SecretHasher;
use super::identity::IdentityResolver;
use super::jwt::{TokenClaims, TokenIssuer, TokenPair};
use super::metrics::record_auth_attempt;
use super::security_audit::SecurityEventRecorder;
use super::store::IdentityStore;
use super::throttle::{subject_key, LoginThrottle};
use crate::config::IdentityConfig;
use crate::models::{
    Account, AccountToken, AuthenticationBinding, ClientContext, SecurityEvent,
    SecurityEventKind, TokenPurpose,
};
use crate::utils::{check_password_strength, generate_secret, Password};

pub const DELETE_CONFIRMATION: &str = "DELETE";
const MAX_DISPLAY_NAME_CHARS: usize = 100;

/// Account plus a fresh token pair.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub account: Account,
    pub tokens: TokenPair,
}

/// Throttling policies used by interactive operations.
#[derive(Clone)]
pub struct AuthThrottles {
    pub login: LoginThrottle,
    pub password_change: LoginThrottle,
    /// Reset requests and verification resends.
    pub mailed_links: LoginThrottle,
}

/// How verification and reset links are built and delivered.
#[derive(Clone)]
pub struct AccountLinks {
    pub sender: Arc<dyn EmailSender>,
    pub public_base_url: String,
    pub verification_ttl: Duration,
    pub password_reset_ttl: Duration,
}

impl AccountLinks {
    pub fn from_config(config: &IdentityConfig, sender: Arc<dyn EmailSender>) -> Self {
        Self {
            sender,
            public_base_url: config.public_base_url.clone(),
            verification_ttl: Duration::hours(config.email.verification_ttl_hours),
            password_reset_ttl: Duration::minutes(config.email.password_reset_ttl_minutes),
        }
    }

    fn link(&self, path: &str, token: &str) -> String {
        format!("{}{}?token={}", self.public_base_url, path, token)
    }
}

#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn IdentityStore>,
    resolver: IdentityResolver,
    hasher: Arc<dyn SecretHasher>,
    tokens: TokenIssuer,
    throttles: AuthThrottles,
    links: AccountLinks,
    events: SecurityEventRecorder,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        resolver: IdentityResolver,
        hasher: Arc<dyn SecretHasher>,
        tokens: TokenIssuer,
        throttles: AuthThrottles,
        links: AccountLinks,
        events: SecurityEventRecorder,
    ) -> Self {
        Self {
            store,
            resolver,
            hasher,
            tokens,
            throttles,
            links,
            events,
        }
    }

    #[tracing::instrument(skip(self, password, display_name, ctx))]
    pub async fn register(
        &self,
        email: &str,
        password: &Password,
        display_name: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let email = normalize_email(email);
        if !email.validate_email() {
            return Err(ServiceError::Validation("Invalid email address".to_string()));
        }
        check_password_strength(password.as_str()).map_err(ServiceError::Validation)?;

        let display_name = match display_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => validate_display_name(name)?,
            None => email.split('@').next().unwrap_or_default().to_string(),
        };

        let hash = self
            .hasher
            .hash(password.as_str())
            .await
            .map_err(ServiceError::Internal)?;
        let account = self
            .resolver
            .provision_account(&email, &display_name, Some(hash), false)
            .await?;

        tracing::info!(account_id = account.account_id, "Account registered");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::AccountRegistered)
                .account(account.account_id)
                .client(ctx),
        );

        // The account is usable right away; a lost mail can be resent.
        if let Err(e) = self.send_verification(&account, ctx).await {
            tracing::error!(error = %e, account_id = account.account_id, "Failed to send verification email");
        }

        let tokens = self.tokens.issue_pair(&account).await?;
        Ok(LoginOutcome { account, tokens })
    }

    /// Password login. Throttled per client address and per email before any
    /// hashing happens.
    pub async fn login(
        &self,
        email: &str,
        password: &Password,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let email = normalize_email(email);
        let ip_key = format!("ip:{}", ctx.ip_key());
        let email_key = format!("email:{}", subject_key(&email));

        for key in [&ip_key, &email_key] {
            if let Err(e) = self.throttles.login.guard(key).await {
                record_auth_attempt("password", "throttled");
                self.events.record(
                    SecurityEvent::failed(SecurityEventKind::LoginThrottled)
                        .subject(email.clone())
                        .client(ctx)
                        .detail("password"),
                );
                return Err(e);
            }
        }

        match self.check_password(&email, password).await {
            Ok(account) => {
                self.throttles.login.reset(&ip_key).await;
                self.throttles.login.reset(&email_key).await;
                record_auth_attempt("password", "success");
                self.events.record(
                    SecurityEvent::succeeded(SecurityEventKind::LoginSucceeded)
                        .account(account.account_id)
                        .client(ctx),
                );
                let tokens = self.tokens.issue_pair(&account).await?;
                Ok(LoginOutcome { account, tokens })
            }
            Err((e, account_id)) => {
                record_auth_attempt("password", "failure");
                let mut event = SecurityEvent::failed(SecurityEventKind::LoginFailed)
                    .subject(email.clone())
                    .client(ctx)
                    .detail(e.reason());
                if let Some(id) = account_id {
                    event = event.account(id);
                }
                self.events.record(event);
                Err(e)
            }
        }
    }

    /// Every miss costs one hash verification so timing does not reveal
    /// whether the email exists.
    async fn check_password(
        &self,
        email: &str,
        password: &Password,
    ) -> Result<Account, (ServiceError, Option<i64>)> {
        let account = match self.store.find_account_by_email(email).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.hasher.dummy_verify(password.as_str()).await;
                return Err((ServiceError::InvalidCredentials, None));
            }
            Err(e) => return Err((e.into(), None)),
        };

        let Some(hash) = account.password_hash.as_deref() else {
            self.hasher.dummy_verify(password.as_str()).await;
            return Err((ServiceError::InvalidCredentials, Some(account.account_id)));
        };

        match self.hasher.verify(password.as_str(), hash).await {
            Ok(true) => {}
            Ok(false) => return Err((ServiceError::InvalidCredentials, Some(account.account_id))),
            Err(e) => return Err((ServiceError::Internal(e), Some(account.account_id))),
        }

        if !account.is_active {
            return Err((ServiceError::AccountInactive, Some(account.account_id)));
        }
        Ok(account)
    }

    /// Redeems a refresh token. A replay revokes the whole token family.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let (claims, tokens) = match self.tokens.rotate(refresh_token).await {
            Ok(rotated) => rotated,
            Err(e) if e.is_token_error() => {
                let kind = if matches!(e, ServiceError::TokenReplayed) {
                    SecurityEventKind::TokenReplayDetected
                } else {
                    SecurityEventKind::TokenRejected
                };
                self.events
                    .record(SecurityEvent::failed(kind).client(ctx).detail(e.reason()));
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let account = self.current_account(&claims).await?;
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::TokenRefreshed)
                .account(account.account_id)
                .client(ctx),
        );
        Ok(LoginOutcome { account, tokens })
    }

    pub async fn logout(&self, refresh_token: &str, ctx: &ClientContext) -> Result<(), ServiceError> {
        let claims = self.tokens.revoke(refresh_token).await?;
        let mut event = SecurityEvent::succeeded(SecurityEventKind::LoggedOut).client(ctx);
        if let Ok(uuid) = claims.account_uuid() {
            if let Some(account) = self.store.find_account_by_uuid(uuid).await? {
                event = event.account(account.account_id);
            }
        }
        self.events.record(event);
        Ok(())
    }

    /// Account behind verified token claims. Deleted or deactivated accounts
    /// invalidate the session.
    pub async fn current_account(&self, claims: &TokenClaims) -> Result<Account, ServiceError> {
        let account = self
            .store
            .find_account_by_uuid(claims.account_uuid()?)
            .await?
            .ok_or(ServiceError::TokenInvalid)?;
        if !account.is_active {
            return Err(ServiceError::TokenInvalid);
        }
        Ok(account)
    }

    /// Replaces the password and ends every other session. Returns a fresh
    /// pair for the caller.
    pub async fn change_password(
        &self,
        account: &Account,
        current: &Password,
        new: &Password,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let throttle_key = format!("account:{}", account.account_uuid);
        self.throttles.password_change.guard(&throttle_key).await?;

        let Some(hash) = account.password_hash.as_deref() else {
            return Err(ServiceError::Validation(
                "Account has no local password".to_string(),
            ));
        };
        if !self
            .hasher
            .verify(current.as_str(), hash)
            .await
            .map_err(ServiceError::Internal)?
        {
            self.events.record(
                SecurityEvent::failed(SecurityEventKind::PasswordChanged)
                    .account(account.account_id)
                    .client(ctx)
                    .detail("invalid_current_password"),
            );
            return Err(ServiceError::InvalidCredentials);
        }

        check_password_strength(new.as_str()).map_err(ServiceError::Validation)?;
        if new.as_str() == current.as_str() {
            return Err(ServiceError::Validation(
                "New password must differ from the current one".to_string(),
            ));
        }

        let hash = self
            .hasher
            .hash(new.as_str())
            .await
            .map_err(ServiceError::Internal)?;
        let updated = self.store.set_password_hash(account.account_id, &hash).await?;

        self.tokens.revoke_all_sessions(updated.account_uuid).await?;
        self.throttles.password_change.reset(&throttle_key).await;

        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::PasswordChanged)
                .account(updated.account_id)
                .client(ctx),
        );

        let tokens = self.tokens.issue_pair(&updated).await?;
        Ok(LoginOutcome {
            account: updated,
            tokens,
        })
    }

    /// Deletes the account with its bindings and credentials. Requires the
    /// literal confirmation phrase, and the password when one is set.
    pub async fn delete_account(
        &self,
        account: &Account,
        confirmation: &str,
        password: Option<&Password>,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        if confirmation != DELETE_CONFIRMATION {
            return Err(ServiceError::Validation(format!(
                "Type {} to confirm account deletion",
                DELETE_CONFIRMATION
            )));
        }

        if let Some(hash) = account.password_hash.as_deref() {
            let password = password.ok_or_else(|| {
                ServiceError::Validation("Password is required to delete this account".to_string())
            })?;
            if !self
                .hasher
                .verify(password.as_str(), hash)
                .await
                .map_err(ServiceError::Internal)?
            {
                return Err(ServiceError::InvalidCredentials);
            }
        }

        if !self.store.delete_account(account.account_id).await? {
            return Err(ServiceError::AccountNotFound);
        }
        self.tokens.revoke_all_sessions(account.account_uuid).await?;

        tracing::info!(account_id = account.account_id, "Account deleted");
        self.events
            .record_and_wait(
                SecurityEvent::succeeded(SecurityEventKind::AccountDeleted)
                    .account(account.account_id)
                    .client(ctx),
            )
            .await;
        Ok(())
    }

    pub async fn profile(&self, account_uuid: Uuid) -> Result<Account, ServiceError> {
        self.store
            .find_account_by_uuid(account_uuid)
            .await?
            .ok_or(ServiceError::AccountNotFound)
    }

    pub async fn update_profile(
        &self,
        account: &Account,
        display_name: &str,
        ctx: &ClientContext,
    ) -> Result<Account, ServiceError> {
        let name = validate_display_name(display_name.trim())?;
        let updated = self
            .store
            .update_display_name(account.account_id, &name)
            .await?;

        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::ProfileUpdated)
                .account(updated.account_id)
                .client(ctx),
        );
        Ok(updated)
    }

    async fn issue_account_token(
        &self,
        account: &Account,
        purpose: TokenPurpose,
        ttl: Duration,
    ) -> Result<String, ServiceError> {
        let raw = generate_secret();
        let token = AccountToken::new(account.account_id, AccountToken::digest(&raw), purpose, ttl);
        self.store.replace_account_token(&token).await?;
        Ok(raw)
    }

    /// Takes a mailed token; unknown, already used and expired tokens are
    /// indistinguishable to the caller.
    async fn redeem_account_token(
        &self,
        raw: &str,
        purpose: TokenPurpose,
    ) -> Result<Account, ServiceError> {
        let token = self
            .store
            .take_account_token(&AccountToken::digest(raw.trim()), purpose)
            .await?
            .ok_or(ServiceError::InvalidAccountToken)?;
        if token.is_expired_at(Utc::now()) {
            return Err(ServiceError::InvalidAccountToken);
        }
        self.store
            .find_account_by_id(token.account_id)
            .await?
            .ok_or(ServiceError::InvalidAccountToken)
    }

    async fn send_verification(&self, account: &Account, ctx: &ClientContext) -> Result<(), ServiceError> {
        let raw = self
            .issue_account_token(account, TokenPurpose::EmailVerification, self.links.verification_ttl)
            .await?;
        let link = self.links.link("/auth/verify-email", &raw);
        self.links
            .sender
            .send_verification_email(&account.email, &link)
            .await
            .map_err(ServiceError::Internal)?;

        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::EmailVerificationSent)
                .account(account.account_id)
                .client(ctx),
        );
        Ok(())
    }

    /// Mails a fresh verification link, replacing any earlier one.
    pub async fn resend_verification(
        &self,
        account: &Account,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        if account.email_verified {
            return Err(ServiceError::Validation(
                "Email address is already verified".to_string(),
            ));
        }
        self.throttles
            .mailed_links
            .guard(&format!("verify:{}", account.account_uuid))
            .await?;
        self.send_verification(account, ctx).await
    }

    pub async fn verify_email(&self, token: &str, ctx: &ClientContext) -> Result<Account, ServiceError> {
        let account = match self
            .redeem_account_token(token, TokenPurpose::EmailVerification)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                self.events.record(
                    SecurityEvent::failed(SecurityEventKind::EmailVerified)
                        .client(ctx)
                        .detail(e.reason()),
                );
                return Err(e);
            }
        };

        let account = self.store.mark_email_verified(account.account_id).await?;
        tracing::info!(account_id = account.account_id, "Email verified");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::EmailVerified)
                .account(account.account_id)
                .client(ctx),
        );
        Ok(account)
    }

    /// Starts a password reset. Succeeds whether or not the address belongs
    /// to an account, so the response does not reveal which addresses exist.
    pub async fn request_password_reset(
        &self,
        email: &str,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        self.throttles
            .mailed_links
            .guard(&format!("reset:{}", subject_key(&email)))
            .await?;

        let Some(account) = self.store.find_account_by_email(&email).await? else {
            self.events.record(
                SecurityEvent::failed(SecurityEventKind::PasswordResetRequested)
                    .subject(email)
                    .client(ctx)
                    .detail("unknown_email"),
            );
            return Ok(());
        };

        let raw = self
            .issue_account_token(&account, TokenPurpose::PasswordReset, self.links.password_reset_ttl)
            .await?;
        let link = self.links.link("/auth/reset-password", &raw);
        if let Err(e) = self
            .links
            .sender
            .send_password_reset_email(&account.email, &link)
            .await
        {
            tracing::error!(error = %e, account_id = account.account_id, "Failed to send password reset email");
        }

        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::PasswordResetRequested)
                .account(account.account_id)
                .client(ctx),
        );
        Ok(())
    }

    /// Completes a reset: sets the new password, marks the address verified
    /// (the link proved control of it) and ends every session.
    pub async fn reset_password(
        &self,
        token: &str,
        new: &Password,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        check_password_strength(new.as_str()).map_err(ServiceError::Validation)?;

        let account = match self
            .redeem_account_token(token, TokenPurpose::PasswordReset)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                self.events.record(
                    SecurityEvent::failed(SecurityEventKind::PasswordReset)
                        .client(ctx)
                        .detail(e.reason()),
                );
                return Err(e);
            }
        };

        let hash = self
            .hasher
            .hash(new.as_str())
            .await
            .map_err(ServiceError::Internal)?;
        self.store.set_password_hash(account.account_id, &hash).await?;
        if !account.email_verified {
            self.store.mark_email_verified(account.account_id).await?;
        }
        self.tokens.revoke_all_sessions(account.account_uuid).await?;

        tracing::info!(account_id = account.account_id, "Password reset");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::PasswordReset)
                .account(account.account_id)
                .client(ctx),
        );
        Ok(())
    }

    /// Federated providers bound to the account, oldest first.
    pub async fn linked_providers(
        &self,
        account: &Account,
    ) -> Result<Vec<AuthenticationBinding>, ServiceError> {
        Ok(self.store.list_bindings(account.account_id).await?)
    }

    /// Removes every binding to `provider`. Refused when it would leave the
    /// account with no way to sign in.
    pub async fn unlink_provider(
        &self,
        account: &Account,
        provider: &str,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        let account = self
            .store
            .find_account_by_id(account.account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;
        let bindings = self.store.list_bindings(account.account_id).await?;

        if !bindings.iter().any(|b| b.provider == provider) {
            return Err(ServiceError::Validation(format!(
                "Provider {} is not linked",
                provider
            )));
        }
        let other_providers = bindings.iter().filter(|b| b.provider != provider).count();
        if account.password_hash.is_none() && other_providers == 0 {
            return Err(ServiceError::Validation(
                "Set a password or link another provider before unlinking this one".to_string(),
            ));
        }

        let removed = self.store.delete_bindings(account.account_id, provider).await?;
        tracing::info!(account_id = account.account_id, provider, removed, "Provider unlinked");
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::ProviderUnlinked)
                .account(account.account_id)
                .client(ctx)
                .detail(provider.to_string()),
        );
        Ok(())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_display_name(name: &str) -> Result<String, ServiceError> {
    let len = name.chars().count();
    if len == 0 || len > MAX_DISPLAY_NAME_CHARS {
        return Err(ServiceError::Validation(format!(
            "Display name must be 1-{} characters",
            MAX_DISPLAY_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}
