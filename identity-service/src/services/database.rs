//! PostgreSQL implementation of the identity store.
//!
//! Uniqueness (email, username, provider subject) is enforced by table
//! constraints; violations surface as `StoreError::Conflict` carrying the
//! constraint name so callers can tell a lost race from a real failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::store::{EventSink, IdentityStore, StoreError};
use crate::models::{
    Account, AccountToken, AuthenticationBinding, Credential, NewAccount, NewBinding,
    SecurityEvent, TokenPurpose,
};

const ACCOUNT_COLUMNS: &str = "account_id, account_uuid, email, username, display_name, password_hash, is_active, email_verified, created_utc, updated_utc";
const BINDING_COLUMNS: &str =
    "binding_id, account_id, provider, provider_subject, provider_email, created_utc";
const ACCOUNT_TOKEN_COLUMNS: &str = "token_hash, account_id, purpose, expires_utc, created_utc";
const CREDENTIAL_COLUMNS: &str = "credential_uuid, account_id, label, username, secret_hash, access_level, resource_kind, expires_utc, revoked_utc, last_used_utc, last_used_ip, created_utc";

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_error(context: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(db_err.constraint().unwrap_or("unknown").to_string())
        }
        _ => StoreError::Backend(anyhow::anyhow!("{}: {}", context, e)),
    }
}

fn require_account(account: Option<Account>, account_id: i64) -> Result<Account, StoreError> {
    account.ok_or_else(|| {
        StoreError::Backend(anyhow::anyhow!(
            "Account {} disappeared during update",
            account_id
        ))
    })
}

#[async_trait]
impl IdentityStore for Database {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Database health check failed", e))?;
        Ok(())
    }

    // ==================== Accounts ====================

    #[instrument(skip(self, new), fields(account_uuid = %new.account_uuid))]
    async fn create_account(&self, new: &NewAccount) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            INSERT INTO accounts (account_uuid, email, username, display_name, password_hash, email_verified)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(new.account_uuid)
        .bind(&new.email)
        .bind(&new.username)
        .bind(&new.display_name)
        .bind(&new.password_hash)
        .bind(new.email_verified)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("Failed to create account", e))?;

        tracing::info!(account_id = account.account_id, "Account created");
        Ok(account)
    }

    async fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load account", e))
    }

    async fn find_account_by_uuid(
        &self,
        account_uuid: Uuid,
    ) -> Result<Option<Account>, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_uuid = $1"
        ))
        .bind(account_uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load account", e))
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load account by email", e))
    }

    async fn find_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Account>, StoreError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load account by username", e))
    }

    #[instrument(skip(self, display_name))]
    async fn update_display_name(
        &self,
        account_id: i64,
        display_name: &str,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET display_name = $2, updated_utc = NOW()
            WHERE account_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to update display name", e))?;
        require_account(account, account_id)
    }

    #[instrument(skip(self, password_hash))]
    async fn set_password_hash(
        &self,
        account_id: i64,
        password_hash: &str,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET password_hash = $2, updated_utc = NOW()
            WHERE account_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to set password hash", e))?;
        require_account(account, account_id)
    }

    #[instrument(skip(self))]
    async fn mark_email_verified(&self, account_id: i64) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET email_verified = TRUE, updated_utc = NOW()
            WHERE account_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to mark email verified", e))?;
        require_account(account, account_id)
    }

    #[instrument(skip(self))]
    async fn set_account_active(
        &self,
        account_id: i64,
        active: bool,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts SET is_active = $2, updated_utc = NOW()
            WHERE account_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to update account status", e))?;
        require_account(account, account_id)
    }

    #[instrument(skip(self))]
    async fn delete_account(&self, account_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to delete account", e))?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Bindings ====================

    #[instrument(skip(self, new), fields(provider = %new.provider, account_id = new.account_id))]
    async fn create_binding(&self, new: &NewBinding) -> Result<AuthenticationBinding, StoreError> {
        sqlx::query_as::<_, AuthenticationBinding>(&format!(
            r#"
            INSERT INTO authentication_bindings (binding_id, account_id, provider, provider_subject, provider_email)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {BINDING_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.account_id)
        .bind(&new.provider)
        .bind(&new.provider_subject)
        .bind(&new.provider_email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_error("Failed to create binding", e))
    }

    async fn find_binding(
        &self,
        provider: &str,
        provider_subject: &str,
    ) -> Result<Option<AuthenticationBinding>, StoreError> {
        sqlx::query_as::<_, AuthenticationBinding>(&format!(
            "SELECT {BINDING_COLUMNS} FROM authentication_bindings WHERE provider = $1 AND provider_subject = $2"
        ))
        .bind(provider)
        .bind(provider_subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load binding", e))
    }

    async fn list_bindings(
        &self,
        account_id: i64,
    ) -> Result<Vec<AuthenticationBinding>, StoreError> {
        sqlx::query_as::<_, AuthenticationBinding>(&format!(
            "SELECT {BINDING_COLUMNS} FROM authentication_bindings WHERE account_id = $1 ORDER BY created_utc"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list bindings", e))
    }

    #[instrument(skip(self))]
    async fn delete_bindings(&self, account_id: i64, provider: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM authentication_bindings WHERE account_id = $1 AND provider = $2",
        )
        .bind(account_id)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to delete bindings", e))?;
        Ok(result.rows_affected())
    }

    // ==================== Mailed tokens ====================

    #[instrument(skip(self, token), fields(account_id = token.account_id, purpose = %token.purpose))]
    async fn replace_account_token(&self, token: &AccountToken) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;

        sqlx::query("DELETE FROM account_tokens WHERE account_id = $1 AND purpose = $2")
            .bind(token.account_id)
            .bind(&token.purpose)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("Failed to clear previous tokens", e))?;

        sqlx::query(
            r#"
            INSERT INTO account_tokens (token_hash, account_id, purpose, expires_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.account_id)
        .bind(&token.purpose)
        .bind(token.expires_utc)
        .bind(token.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_error("Failed to store token", e))?;

        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit token", e))
    }

    async fn take_account_token(
        &self,
        token_hash: &str,
        purpose: TokenPurpose,
    ) -> Result<Option<AccountToken>, StoreError> {
        sqlx::query_as::<_, AccountToken>(&format!(
            "DELETE FROM account_tokens WHERE token_hash = $1 AND purpose = $2 RETURNING {ACCOUNT_TOKEN_COLUMNS}"
        ))
        .bind(token_hash)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to redeem token", e))
    }

    // ==================== Credentials ====================

    #[instrument(skip(self, credential), fields(credential_id = %credential.credential_uuid))]
    async fn create_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (credential_uuid, account_id, label, username, secret_hash, access_level, resource_kind, expires_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(credential.credential_uuid)
        .bind(credential.account_id)
        .bind(&credential.label)
        .bind(&credential.username)
        .bind(&credential.secret_hash)
        .bind(&credential.access_level)
        .bind(&credential.resource_kind)
        .bind(credential.expires_utc)
        .bind(credential.created_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to create credential", e))?;
        Ok(())
    }

    async fn list_credentials(&self, account_id: i64) -> Result<Vec<Credential>, StoreError> {
        sqlx::query_as::<_, Credential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE account_id = $1 ORDER BY created_utc DESC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to list credentials", e))
    }

    async fn find_credential(
        &self,
        credential_uuid: Uuid,
    ) -> Result<Option<Credential>, StoreError> {
        sqlx::query_as::<_, Credential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE credential_uuid = $1"
        ))
        .bind(credential_uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load credential", e))
    }

    async fn find_credentials_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<Credential>, StoreError> {
        sqlx::query_as::<_, Credential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE username = $1 ORDER BY created_utc DESC"
        ))
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("Failed to load credentials by username", e))
    }

    #[instrument(skip(self, credential), fields(credential_id = %credential.credential_uuid))]
    async fn update_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE credentials SET label = $2, expires_utc = $3, revoked_utc = $4 WHERE credential_uuid = $1",
        )
        .bind(credential.credential_uuid)
        .bind(&credential.label)
        .bind(credential.expires_utc)
        .bind(credential.revoked_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to update credential", e))?;
        Ok(())
    }

    async fn touch_credential(
        &self,
        credential_uuid: Uuid,
        used_utc: DateTime<Utc>,
        source_ip: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE credentials SET last_used_utc = $2, last_used_ip = $3 WHERE credential_uuid = $1",
        )
        .bind(credential_uuid)
        .bind(used_utc)
        .bind(source_ip)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to record credential usage", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_credential(&self, credential_uuid: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM credentials WHERE credential_uuid = $1")
            .bind(credential_uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to delete credential", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EventSink for Database {
    async fn append(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO security_events (event_id, occurred_utc, event_kind, account_id, subject_hint, client_ip, user_agent, success, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.event_id)
        .bind(event.occurred_utc)
        .bind(event.kind.as_str())
        .bind(event.account_id)
        .bind(&event.subject_hint)
        .bind(&event.client_ip)
        .bind(&event.user_agent)
        .bind(event.success)
        .bind(&event.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("Failed to append security event", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::services::store::ACCOUNT_EMAIL_CONSTRAINT;

    async fn database() -> Database {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/identity_test".to_string()),
            max_connections: 2,
            min_connections: 1,
        };
        Database::new(crate::db::connect(&config).await.expect("connect"))
    }

    fn new_account(email: &str) -> NewAccount {
        NewAccount {
            account_uuid: Uuid::new_v4(),
            email: email.to_string(),
            username: Uuid::new_v4().simple().to_string()[..16].to_string(),
            display_name: "Test".to_string(),
            password_hash: None,
            email_verified: true,
        }
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn duplicate_email_reports_constraint_name() {
        let db = database().await;
        let email = format!("dup-{}@example.com", Uuid::new_v4());

        let first = db.create_account(&new_account(&email)).await.expect("first insert");
        let err = db
            .create_account(&new_account(&email))
            .await
            .expect_err("second insert must conflict");
        assert!(err.is_conflict_on(ACCOUNT_EMAIL_CONSTRAINT));

        db.delete_account(first.account_id).await.expect("cleanup");
    }
}
