use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{AccountSummary, CredentialScope, CredentialView};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateCredentialRequest {
    #[validate(length(min = 1, max = 100, message = "Label must be 1-100 characters"))]
    #[schema(example = "phone")]
    pub label: String,

    /// Defaults to read-write on every resource type.
    #[serde(default)]
    pub scope: Option<CredentialScope>,

    /// Protocol username. Defaults to the account username.
    #[validate(length(min = 3, max = 50, message = "Username must be 3-50 characters"))]
    #[schema(example = "alice_cred_username")]
    pub username: Option<String>,

    pub expires_utc: Option<DateTime<Utc>>,
}

/// The only response that ever carries the plaintext secret.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedCredentialResponse {
    pub credential: CredentialView,
    #[schema(example = "q3J9x0b6rS0m1dQyI9m0Xr2wD6yQ8kUeN4f3lV7pZcA")]
    pub secret: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialListResponse {
    pub credentials: Vec<CredentialView>,
}

/// Identity proven by a protocol credential.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProtocolPrincipal {
    pub account: AccountSummary,
    pub credential_id: Uuid,
    pub scope: CredentialScope,
}
