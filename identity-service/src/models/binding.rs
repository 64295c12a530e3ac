use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Link between a local account and one provider's subject identifier.
/// `(provider, provider_subject)` is unique.
#[derive(Debug, Clone, FromRow)]
pub struct AuthenticationBinding {
    pub binding_id: Uuid,
    pub account_id: i64,
    pub provider: String,
    pub provider_subject: String,
    pub provider_email: Option<String>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBinding {
    pub account_id: i64,
    pub provider: String,
    pub provider_subject: String,
    pub provider_email: Option<String>,
}

/// Binding as shown to the account owner.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BindingView {
    #[schema(example = "corp-sso")]
    pub provider: String,
    pub provider_email: Option<String>,
    pub linked_utc: DateTime<Utc>,
}

impl From<&AuthenticationBinding> for BindingView {
    fn from(b: &AuthenticationBinding) -> Self {
        Self {
            provider: b.provider.clone(),
            provider_email: b.provider_email.clone(),
            linked_utc: b.created_utc,
        }
    }
}
