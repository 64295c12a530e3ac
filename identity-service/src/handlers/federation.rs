use service_core::{
    axum::{
        extract::{Path, Query, State},
        http::header,
        response::{IntoResponse, Redirect},
        Form, Json,
    },
    error::AppError,
};

use crate::{
    dtos::{
        auth::{AssertionForm, FederationLoginQuery, ProvidersResponse, SessionResponse},
        ErrorResponse,
    },
    models::ClientContext,
    AppState,
};

/// List configured identity providers
#[utoipa::path(
    get,
    path = "/auth/federation/providers",
    responses((status = 200, description = "Provider names", body = ProvidersResponse)),
    tag = "Federation"
)]
pub async fn providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(ProvidersResponse {
        providers: state.federation.provider_names(),
    })
}

/// Start SP-initiated sign-in by redirecting to the identity provider
#[utoipa::path(
    get,
    path = "/auth/federation/{provider}/login",
    params(
        ("provider" = String, Path, description = "Configured provider name"),
        FederationLoginQuery
    ),
    responses(
        (status = 303, description = "Redirect to the identity provider"),
        (status = 400, description = "Unknown provider", body = ErrorResponse)
    ),
    tag = "Federation"
)]
pub async fn initiate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<FederationLoginQuery>,
) -> Result<impl IntoResponse, AppError> {
    let url = state
        .federation
        .initiate(&provider, query.relay_state.as_deref())?;
    Ok(Redirect::to(&url))
}

/// Assertion consumer: validate the IdP response and open a session
#[utoipa::path(
    post,
    path = "/auth/federation/{provider}/acs",
    params(("provider" = String, Path, description = "Configured provider name")),
    request_body(content = AssertionForm, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Signed in", body = SessionResponse),
        (status = 401, description = "Federated sign-in failed", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Federation"
)]
pub async fn consume_assertion(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ctx: ClientContext,
    Form(form): Form<AssertionForm>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .federation
        .complete(&provider, &form.saml_response, &ctx)
        .await?;
    Ok(Json(SessionResponse::from(outcome)))
}

/// Service-provider metadata document for one provider
#[utoipa::path(
    get,
    path = "/auth/federation/{provider}/metadata",
    params(("provider" = String, Path, description = "Configured provider name")),
    responses(
        (status = 200, description = "SP metadata", body = String, content_type = "application/samlmetadata+xml"),
        (status = 400, description = "Unknown provider", body = ErrorResponse),
        (status = 404, description = "Provider publishes no metadata", body = ErrorResponse)
    ),
    tag = "Federation"
)]
pub async fn metadata(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let xml = state
        .federation
        .metadata(&provider, &state.config.public_base_url)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No metadata for {}", provider)))?;
    Ok((
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        xml,
    ))
}
