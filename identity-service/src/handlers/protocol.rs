use service_core::axum::{response::IntoResponse, Json};

use crate::dtos::{credential::ProtocolPrincipal, ErrorResponse};

/// Identity behind the presented protocol credential
#[utoipa::path(
    get,
    path = "/protocol/principal",
    responses(
        (status = 200, description = "Authenticated principal", body = ProtocolPrincipal),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    security(("basic_auth" = [])),
    tag = "Protocol"
)]
pub async fn principal(principal: ProtocolPrincipal) -> impl IntoResponse {
    Json(principal)
}
