use service_core::error::AppError;
use thiserror::Error;

use super::store::StoreError;

/// Caller-facing message for every credential or password failure.
pub const INVALID_CREDENTIALS: &str = "Invalid credentials";
/// Caller-facing message for every token failure.
pub const SESSION_EXPIRED: &str = "Session expired, please re-authenticate";
/// Caller-facing message for federation failures.
pub const FEDERATION_FAILED: &str = "Federated sign-in failed";
/// Caller-facing message for unknown, used or expired mailed links.
pub const INVALID_ACCOUNT_TOKEN: &str = "Link is invalid or has expired";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Federation failed")]
    FederationFailed { detail: Option<String> },

    #[error("Missing required attribute: {0}")]
    MissingRequiredAttribute(String),

    #[error("Credential not found")]
    CredentialNotFound,

    #[error("Credential expired")]
    CredentialExpired,

    #[error("Credential revoked")]
    CredentialRevoked,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token invalid")]
    TokenInvalid,

    #[error("Refresh token replayed")]
    TokenReplayed,

    #[error("Too many attempts, retry after {retry_after_secs}s")]
    ThrottleExceeded { retry_after_secs: u64 },

    #[error("Credential belongs to another account")]
    NotOwner,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account inactive")]
    AccountInactive,

    #[error("Account not found")]
    AccountNotFound,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("Email address not verified")]
    EmailNotVerified,

    #[error("Account token invalid or expired")]
    InvalidAccountToken,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Short machine-readable reason for logs and security events.
    pub fn reason(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::FederationFailed { .. } => "federation_failed",
            ServiceError::MissingRequiredAttribute(_) => "missing_required_attribute",
            ServiceError::CredentialNotFound => "credential_not_found",
            ServiceError::CredentialExpired => "credential_expired",
            ServiceError::CredentialRevoked => "credential_revoked",
            ServiceError::TokenExpired => "token_expired",
            ServiceError::TokenInvalid => "token_invalid",
            ServiceError::TokenReplayed => "token_replayed",
            ServiceError::ThrottleExceeded { .. } => "throttled",
            ServiceError::NotOwner => "not_owner",
            ServiceError::InvalidCredentials => "invalid_credentials",
            ServiceError::AccountInactive => "account_inactive",
            ServiceError::AccountNotFound => "account_not_found",
            ServiceError::EmailAlreadyRegistered => "email_already_registered",
            ServiceError::EmailNotVerified => "email_not_verified",
            ServiceError::InvalidAccountToken => "invalid_account_token",
            ServiceError::Store(_) => "store_error",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            ServiceError::TokenExpired | ServiceError::TokenInvalid | ServiceError::TokenReplayed
        )
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::MissingRequiredAttribute(_) => {
                AppError::unauthorized(FEDERATION_FAILED)
            }
            ServiceError::FederationFailed { detail } => AppError::Unauthorized {
                message: FEDERATION_FAILED.to_string(),
                challenge: None,
                details: detail,
            },
            ServiceError::CredentialNotFound
            | ServiceError::CredentialExpired
            | ServiceError::CredentialRevoked
            | ServiceError::InvalidCredentials
            | ServiceError::AccountInactive => AppError::unauthorized(INVALID_CREDENTIALS),
            ServiceError::TokenExpired | ServiceError::TokenInvalid | ServiceError::TokenReplayed => {
                AppError::unauthorized(SESSION_EXPIRED)
            }
            ServiceError::ThrottleExceeded { retry_after_secs } => AppError::TooManyRequests(
                "Too many attempts. Please try again later.".to_string(),
                Some(retry_after_secs),
            ),
            ServiceError::NotOwner => {
                AppError::Forbidden(anyhow::anyhow!("Credential belongs to another account"))
            }
            ServiceError::AccountNotFound => AppError::NotFound(anyhow::anyhow!("Account not found")),
            ServiceError::EmailAlreadyRegistered => {
                AppError::Conflict(anyhow::anyhow!("Email already registered"))
            }
            ServiceError::EmailNotVerified => {
                AppError::Forbidden(anyhow::anyhow!("Email address not verified"))
            }
            ServiceError::InvalidAccountToken => {
                AppError::BadRequest(anyhow::anyhow!(INVALID_ACCOUNT_TOKEN))
            }
            ServiceError::Store(e) => AppError::DatabaseError(anyhow::anyhow!(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}
