use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
use service_core::error::AppError;

use crate::{
    models::Account,
    services::{error::SESSION_EXPIRED, ServiceError, TokenClaims},
    AppState,
};

/// Requires a valid access token from a current session.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or_else(|| AppError::unauthorized("Missing or invalid Authorization header"))?;

    let claims = state.tokens.verify(bearer.token()).map_err(reject)?;
    state
        .tokens
        .ensure_current_session(&claims)
        .await
        .map_err(reject)?;
    let account = state
        .auth_service
        .current_account(&claims)
        .await
        .map_err(reject)?;

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(CurrentAccount(account));

    Ok(next.run(req).await)
}

fn reject(err: ServiceError) -> AppError {
    if err.is_token_error() {
        tracing::debug!(reason = err.reason(), "Bearer token rejected");
        AppError::unauthorized(SESSION_EXPIRED)
    } else {
        err.into()
    }
}

/// Account of the authenticated caller.
#[derive(Debug, Clone)]
pub struct CurrentAccount(pub Account);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentAccount
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentAccount>()
            .cloned()
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Authenticated account missing from request extensions"
                ))
            })
    }
}

/// Verified claims of the caller's access token.
pub struct AuthClaims(pub TokenClaims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthClaims
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TokenClaims>()
            .cloned()
            .map(AuthClaims)
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Auth claims missing from request extensions"
                ))
            })
    }
}
