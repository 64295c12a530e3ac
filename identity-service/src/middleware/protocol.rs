use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Basic, Authorization, HeaderMapExt};
use service_core::error::AppError;

use crate::{
    dtos::credential::ProtocolPrincipal,
    models::ClientContext,
    services::error::INVALID_CREDENTIALS,
    AppState,
};

pub const BASIC_CHALLENGE: &str = "Basic realm=\"identity\", charset=\"UTF-8\"";

/// Basic-auth gate for non-interactive protocol clients.
pub async fn protocol_auth_middleware(
    State(state): State<AppState>,
    ctx: ClientContext,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let basic = req
        .headers()
        .typed_get::<Authorization<Basic>>()
        .ok_or_else(|| AppError::unauthorized(INVALID_CREDENTIALS).with_challenge(BASIC_CHALLENGE))?;

    let verified = state
        .credentials
        .authenticate(basic.username(), basic.password(), &ctx)
        .await
        .map_err(|e| AppError::from(e).with_challenge(BASIC_CHALLENGE))?;

    req.extensions_mut().insert(ProtocolPrincipal {
        account: verified.account.summary(),
        credential_id: verified.credential.credential_uuid,
        scope: verified.scope,
    });

    Ok(next.run(req).await)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ProtocolPrincipal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ProtocolPrincipal>()
            .cloned()
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Protocol principal missing from request extensions"
                ))
            })
    }
}
