use secrecy::ExposeSecret;
use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};
use uuid::Uuid;

use crate::{
    dtos::{
        credential::{CreateCredentialRequest, CreatedCredentialResponse, CredentialListResponse},
        ErrorResponse,
    },
    middleware::CurrentAccount,
    models::{ClientContext, CredentialView},
    services::{NewCredential, ServiceError},
    utils::ValidatedJson,
    AppState,
};

/// Owner-facing lookups report a missing credential as 404 rather than the
/// generic protocol 401.
fn not_found(err: ServiceError) -> AppError {
    match err {
        ServiceError::CredentialNotFound => {
            AppError::NotFound(anyhow::anyhow!("Credential not found"))
        }
        other => other.into(),
    }
}

/// Issue a protocol credential. The secret is returned once.
#[utoipa::path(
    post,
    path = "/credentials",
    request_body = CreateCredentialRequest,
    responses(
        (status = 201, description = "Credential created", body = CreatedCredentialResponse),
        (status = 400, description = "Invalid label, username or expiry", body = ErrorResponse),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Credentials"
)]
pub async fn create_credential(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<CreateCredentialRequest>,
) -> Result<impl IntoResponse, AppError> {
    let issued = state
        .credentials
        .create(
            &account,
            NewCredential {
                label: req.label,
                scope: req.scope.unwrap_or_default(),
                username: req.username,
                expires_utc: req.expires_utc,
            },
            &ctx,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedCredentialResponse {
            credential: issued.credential.view(),
            secret: issued.secret.expose_secret().clone(),
        }),
    ))
}

/// List the caller's credentials, including revoked and expired ones
#[utoipa::path(
    get,
    path = "/credentials",
    responses(
        (status = 200, description = "Credentials", body = CredentialListResponse),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Credentials"
)]
pub async fn list_credentials(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
) -> Result<impl IntoResponse, AppError> {
    let credentials = state.credentials.list(&account).await?;
    Ok(Json(CredentialListResponse {
        credentials: credentials.iter().map(CredentialView::from).collect(),
    }))
}

/// Revoke a credential. Takes effect on the next protocol request.
#[utoipa::path(
    delete,
    path = "/credentials/{id}",
    params(("id" = Uuid, Path, description = "Credential id")),
    responses(
        (status = 200, description = "Credential revoked", body = CredentialView),
        (status = 403, description = "Credential belongs to another account", body = ErrorResponse),
        (status = 404, description = "Credential not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Credentials"
)]
pub async fn revoke_credential(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let credential = state
        .credentials
        .revoke(id, &account, &ctx)
        .await
        .map_err(not_found)?;
    Ok(Json(credential.view()))
}

/// Permanently delete a revoked or expired credential
#[utoipa::path(
    delete,
    path = "/credentials/{id}/history",
    params(("id" = Uuid, Path, description = "Credential id")),
    responses(
        (status = 204, description = "Credential removed"),
        (status = 400, description = "Credential is still active", body = ErrorResponse),
        (status = 403, description = "Credential belongs to another account", body = ErrorResponse),
        (status = 404, description = "Credential not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Credentials"
)]
pub async fn remove_credential(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state
        .credentials
        .remove(id, &account, &ctx)
        .await
        .map_err(not_found)?;
    Ok(StatusCode::NO_CONTENT)
}
