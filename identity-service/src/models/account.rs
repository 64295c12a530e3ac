//! Account model - the identity anchor every login method resolves to.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Local account.
///
/// `password_hash` is `None` for accounts that only ever signed in through a
/// federated provider. Only registration, password change and password reset
/// write it, each through its own single-column store update.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: i64,
    pub account_uuid: Uuid,
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Account {
    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary::from(self)
    }
}

/// Fields supplied when provisioning an account. The store assigns ids and timestamps.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub account_uuid: Uuid,
    pub email: String,
    pub username: String,
    pub display_name: String,
    pub password_hash: Option<String>,
    pub email_verified: bool,
}

/// Account view returned to callers (no hash, no internal id).
#[derive(Debug, Clone, Serialize, ToSchema, PartialEq)]
pub struct AccountSummary {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub account_id: Uuid,
    #[schema(example = "alice@example.com")]
    pub email: String,
    #[schema(example = "QwErTyUiOpAsDfGh")]
    pub username: String,
    #[schema(example = "Alice Example")]
    pub display_name: String,
    pub email_verified: bool,
    pub has_password: bool,
    pub created_utc: DateTime<Utc>,
}

impl From<&Account> for AccountSummary {
    fn from(a: &Account) -> Self {
        Self {
            account_id: a.account_uuid,
            email: a.email.clone(),
            username: a.username.clone(),
            display_name: a.display_name.clone(),
            email_verified: a.email_verified,
            has_password: a.has_password(),
            created_utc: a.created_utc,
        }
    }
}
