//! Security event log entries.
//!
//! Every authentication-relevant operation appends one of these. They are
//! consumed by operators only and never read on the auth decision path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ClientContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    AccountRegistered,
    LoginSucceeded,
    LoginFailed,
    LoginThrottled,
    FederationSucceeded,
    FederationFailed,
    TokenRefreshed,
    TokenRejected,
    TokenReplayDetected,
    LoggedOut,
    PasswordChanged,
    PasswordResetRequested,
    PasswordReset,
    EmailVerificationSent,
    EmailVerified,
    ProviderUnlinked,
    ProfileUpdated,
    AccountDeleted,
    CredentialCreated,
    CredentialRevoked,
    CredentialRemoved,
    CredentialOwnershipDenied,
    CredentialAuthSucceeded,
    CredentialAuthFailed,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::AccountRegistered => "account_registered",
            SecurityEventKind::LoginSucceeded => "login_succeeded",
            SecurityEventKind::LoginFailed => "login_failed",
            SecurityEventKind::LoginThrottled => "login_throttled",
            SecurityEventKind::FederationSucceeded => "federation_succeeded",
            SecurityEventKind::FederationFailed => "federation_failed",
            SecurityEventKind::TokenRefreshed => "token_refreshed",
            SecurityEventKind::TokenRejected => "token_rejected",
            SecurityEventKind::TokenReplayDetected => "token_replay_detected",
            SecurityEventKind::LoggedOut => "logged_out",
            SecurityEventKind::PasswordChanged => "password_changed",
            SecurityEventKind::PasswordResetRequested => "password_reset_requested",
            SecurityEventKind::PasswordReset => "password_reset",
            SecurityEventKind::EmailVerificationSent => "email_verification_sent",
            SecurityEventKind::EmailVerified => "email_verified",
            SecurityEventKind::ProviderUnlinked => "provider_unlinked",
            SecurityEventKind::ProfileUpdated => "profile_updated",
            SecurityEventKind::AccountDeleted => "account_deleted",
            SecurityEventKind::CredentialCreated => "credential_created",
            SecurityEventKind::CredentialRevoked => "credential_revoked",
            SecurityEventKind::CredentialRemoved => "credential_removed",
            SecurityEventKind::CredentialOwnershipDenied => "credential_ownership_denied",
            SecurityEventKind::CredentialAuthSucceeded => "credential_auth_succeeded",
            SecurityEventKind::CredentialAuthFailed => "credential_auth_failed",
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub occurred_utc: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub account_id: Option<i64>,
    /// Email or username that was presented, when no account is known.
    pub subject_hint: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, success: bool) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_utc: Utc::now(),
            kind,
            account_id: None,
            subject_hint: None,
            client_ip: None,
            user_agent: None,
            success,
            detail: String::new(),
        }
    }

    pub fn succeeded(kind: SecurityEventKind) -> Self {
        Self::new(kind, true)
    }

    pub fn failed(kind: SecurityEventKind) -> Self {
        Self::new(kind, false)
    }

    pub fn account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn subject(mut self, hint: impl Into<String>) -> Self {
        self.subject_hint = Some(hint.into());
        self
    }

    pub fn client(mut self, ctx: &ClientContext) -> Self {
        self.client_ip = ctx.ip.map(|ip| ip.to_string());
        self.user_agent = ctx.user_agent.clone();
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}
