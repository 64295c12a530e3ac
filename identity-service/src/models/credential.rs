//! Protocol credential ("app password") model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Access level granted by a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum AccessLevel {
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "read-write")]
    ReadWrite,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::ReadWrite => "read-write",
        }
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessLevel::Read),
            "read-write" => Ok(AccessLevel::ReadWrite),
            _ => Err(format!("Invalid access level: {}", s)),
        }
    }
}

/// Resource type a credential can be narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Calendars,
    Contacts,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Calendars => "calendars",
            ResourceKind::Contacts => "contacts",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calendars" => Ok(ResourceKind::Calendars),
            "contacts" => Ok(ResourceKind::Contacts),
            _ => Err(format!("Invalid resource kind: {}", s)),
        }
    }
}

/// Permission scope: access level plus an optional resource restriction
/// (`None` covers every resource type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CredentialScope {
    pub access: AccessLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
}

impl CredentialScope {
    pub fn read() -> Self {
        Self {
            access: AccessLevel::Read,
            resource: None,
        }
    }

    pub fn read_write() -> Self {
        Self {
            access: AccessLevel::ReadWrite,
            resource: None,
        }
    }

    pub fn covers(&self, kind: ResourceKind) -> bool {
        self.resource.map_or(true, |r| r == kind)
    }

    pub fn allows_write(&self) -> bool {
        self.access == AccessLevel::ReadWrite
    }
}

impl Default for CredentialScope {
    fn default() -> Self {
        Self::read_write()
    }
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource {
            Some(kind) => write!(f, "{}:{}", self.access.as_str(), kind.as_str()),
            None => f.write_str(self.access.as_str()),
        }
    }
}

/// Lifecycle state of a credential at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    Expired,
    Revoked,
}

/// Stored credential. Only the Argon2 hash of the secret is kept.
#[derive(Debug, Clone, FromRow)]
pub struct Credential {
    pub credential_uuid: Uuid,
    pub account_id: i64,
    pub label: String,
    pub username: String,
    pub secret_hash: String,
    pub access_level: String,
    pub resource_kind: Option<String>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        account_id: i64,
        label: String,
        username: String,
        secret_hash: String,
        scope: CredentialScope,
        expires_utc: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            credential_uuid: Uuid::new_v4(),
            account_id,
            label,
            username,
            secret_hash,
            access_level: scope.access.as_str().to_string(),
            resource_kind: scope.resource.map(|r| r.as_str().to_string()),
            expires_utc,
            revoked_utc: None,
            last_used_utc: None,
            last_used_ip: None,
            created_utc: Utc::now(),
        }
    }

    /// Parsed scope. The table's CHECK constraints bound both columns; an
    /// unrecognized access level still degrades to read-only.
    pub fn scope(&self) -> CredentialScope {
        CredentialScope {
            access: self.access_level.parse().unwrap_or(AccessLevel::Read),
            resource: self
                .resource_kind
                .as_deref()
                .and_then(|raw| raw.parse().ok()),
        }
    }

    /// Revocation outranks expiry.
    pub fn status_at(&self, now: DateTime<Utc>) -> CredentialStatus {
        if self.revoked_utc.is_some() {
            CredentialStatus::Revoked
        } else if self.expires_utc.is_some_and(|exp| exp <= now) {
            CredentialStatus::Expired
        } else {
            CredentialStatus::Active
        }
    }

    pub fn is_owned_by(&self, account_id: i64) -> bool {
        self.account_id == account_id
    }

    pub fn view(&self) -> CredentialView {
        CredentialView::from(self)
    }
}

/// Credential as listed to its owner.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CredentialView {
    pub id: Uuid,
    #[schema(example = "phone")]
    pub label: String,
    #[schema(example = "alice_cred_username")]
    pub username: String,
    pub scope: CredentialScope,
    pub expires_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub last_used_ip: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl From<&Credential> for CredentialView {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.credential_uuid,
            label: c.label.clone(),
            username: c.username.clone(),
            scope: c.scope(),
            expires_utc: c.expires_utc,
            revoked_utc: c.revoked_utc,
            last_used_utc: c.last_used_utc,
            last_used_ip: c.last_used_ip.clone(),
            created_utc: c.created_utc,
        }
    }
}
