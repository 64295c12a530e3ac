use service_core::{
    axum::{
        extract::{Query, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};

use crate::{
    dtos::{
        auth::{
            LoginRequest, LogoutRequest, PasswordResetConfirmRequest, PasswordResetRequest,
            RefreshRequest, RegisterRequest, SessionResponse, VerifyEmailQuery,
        },
        ErrorResponse, MessageResponse,
    },
    models::{AccountSummary, ClientContext},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register a local account and open a session
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created", body = SessionResponse),
        (status = 400, description = "Password too weak", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .auth_service
        .register(
            &req.email,
            &Password::new(req.password),
            req.display_name.as_deref(),
            &ctx,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(outcome))))
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = SessionResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .auth_service
        .login(&req.email, &Password::new(req.password), &ctx)
        .await?;
    Ok(Json(SessionResponse::from(outcome)))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = SessionResponse),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.auth_service.refresh(&req.refresh_token, &ctx).await?;
    Ok(Json(SessionResponse::from(outcome)))
}

/// End the session that owns the refresh token
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Session expired", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn logout(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<LogoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.auth_service.logout(&req.refresh_token, &ctx).await?;
    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// Confirm an email address from a mailed verification link
#[utoipa::path(
    get,
    path = "/auth/verify-email",
    params(VerifyEmailQuery),
    responses(
        (status = 200, description = "Email verified", body = AccountSummary),
        (status = 400, description = "Link is invalid or has expired", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_email(
    State(state): State<AppState>,
    ctx: ClientContext,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<impl IntoResponse, AppError> {
    let account = state.auth_service.verify_email(&query.token, &ctx).await?;
    Ok(Json(account.summary()))
}

/// Mail a password reset link. The response is the same whether or not the
/// address belongs to an account.
#[utoipa::path(
    post,
    path = "/auth/password-reset/request",
    request_body = PasswordResetRequest,
    responses(
        (status = 202, description = "Reset link sent if the account exists", body = MessageResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .request_password_reset(&req.email, &ctx)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If the address is registered, a reset link has been sent",
        )),
    ))
}

/// Set a new password with a reset token. Every session ends.
#[utoipa::path(
    post,
    path = "/auth/password-reset/confirm",
    request_body = PasswordResetConfirmRequest,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Weak password or invalid link", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    ctx: ClientContext,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirmRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .reset_password(&req.token, &Password::new(req.new_password), &ctx)
        .await?;
    Ok(Json(MessageResponse::new("Password has been reset")))
}
