use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::models::AccountSummary;
use crate::services::LoginOutcome;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "alice@example.com")]
    pub email: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    #[schema(example = "Str0ng!pass", min_length = 8)]
    pub password: String,

    #[validate(length(max = 100, message = "Display name must be at most 100 characters"))]
    #[schema(example = "Alice Example")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Email is required"))]
    #[schema(example = "alice@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "Str0ng!pass")]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

/// Returned by every successful interactive login, whatever the method.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 600)]
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    pub account: AccountSummary,
}

impl From<LoginOutcome> for SessionResponse {
    fn from(outcome: LoginOutcome) -> Self {
        Self {
            access_token: outcome.tokens.access_token,
            refresh_token: outcome.tokens.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: outcome.tokens.expires_in,
            expires_at: outcome.tokens.expires_at,
            account: outcome.account.summary(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct FederationLoginQuery {
    /// Opaque value echoed back by the IdP.
    #[param(example = "/calendar")]
    pub relay_state: Option<String>,
}

/// Assertion consumer form post.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AssertionForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProvidersResponse {
    pub providers: Vec<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct VerifyEmailQuery {
    /// Token from the verification link.
    pub token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordResetRequest {
    #[validate(length(min = 1, message = "Email is required"))]
    #[schema(example = "alice@example.com")]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordResetConfirmRequest {
    #[validate(length(min = 1, message = "Reset token is required"))]
    pub token: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    #[schema(min_length = 8)]
    pub new_password: String,
}
