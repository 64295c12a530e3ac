use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use service_core::middleware::rate_limit::client_ip;
use std::convert::Infallible;

use crate::models::ClientContext;

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = client_ip(&parts.extensions);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.chars().take(256).collect());
        Ok(ClientContext::new(ip, user_agent))
    }
}
