use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};

use crate::{
    dtos::{
        account::{
            ChangePasswordRequest, DeleteAccountRequest, LinkedProvidersResponse,
            UpdateProfileRequest,
        },
        auth::SessionResponse,
        ErrorResponse, MessageResponse,
    },
    middleware::CurrentAccount,
    models::{AccountSummary, BindingView, ClientContext},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Get the caller's profile
#[utoipa::path(
    get,
    path = "/users/me",
    responses(
        (status = 200, description = "Current account", body = AccountSummary),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn get_profile(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
) -> Result<impl IntoResponse, AppError> {
    let account = state.auth_service.profile(account.account_uuid).await?;
    Ok(Json(account.summary()))
}

/// Update the caller's display name
#[utoipa::path(
    patch,
    path = "/users/me",
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Profile updated", body = AccountSummary),
        (status = 401, description = "Session expired", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn update_profile(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<UpdateProfileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let updated = state
        .auth_service
        .update_profile(&account, &req.display_name, &ctx)
        .await?;
    Ok(Json(updated.summary()))
}

/// Change the local password. Every other session ends.
#[utoipa::path(
    post,
    path = "/users/me/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed, new session issued", body = SessionResponse),
        (status = 400, description = "Weak or unchanged password", body = ErrorResponse),
        (status = 401, description = "Current password is wrong", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn change_password(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .auth_service
        .change_password(
            &account,
            &Password::new(req.current_password),
            &Password::new(req.new_password),
            &ctx,
        )
        .await?;
    Ok(Json(SessionResponse::from(outcome)))
}

/// Delete the caller's account with its bindings and credentials
#[utoipa::path(
    delete,
    path = "/users/me",
    request_body = DeleteAccountRequest,
    responses(
        (status = 204, description = "Account deleted"),
        (status = 400, description = "Missing confirmation", body = ErrorResponse),
        (status = 401, description = "Wrong password", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn delete_account(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<DeleteAccountRequest>,
) -> Result<impl IntoResponse, AppError> {
    let password = req.password.map(Password::new);
    state
        .auth_service
        .delete_account(&account, &req.confirmation, password.as_ref(), &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Mail a fresh verification link to the caller
#[utoipa::path(
    post,
    path = "/users/me/email-verification",
    responses(
        (status = 202, description = "Verification link sent", body = MessageResponse),
        (status = 400, description = "Already verified", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn resend_verification(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .resend_verification(&account, &ctx)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Verification link sent")),
    ))
}

/// Identity providers linked to the caller
#[utoipa::path(
    get,
    path = "/users/me/providers",
    responses(
        (status = 200, description = "Linked providers, oldest first", body = LinkedProvidersResponse),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn linked_providers(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
) -> Result<impl IntoResponse, AppError> {
    let bindings = state.auth_service.linked_providers(&account).await?;
    Ok(Json(LinkedProvidersResponse {
        providers: bindings.iter().map(BindingView::from).collect(),
    }))
}

/// Unlink an identity provider from the caller
#[utoipa::path(
    delete,
    path = "/users/me/providers/{provider}",
    params(("provider" = String, Path, description = "Linked provider name")),
    responses(
        (status = 204, description = "Provider unlinked"),
        (status = 400, description = "Not linked, or the last way to sign in", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Account"
)]
pub async fn unlink_provider(
    State(state): State<AppState>,
    CurrentAccount(account): CurrentAccount,
    ctx: ClientContext,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .unlink_provider(&account, &provider, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
