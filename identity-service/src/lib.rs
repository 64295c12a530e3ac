pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{
        client_ip_middleware, create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter,
        TrustedProxies,
    },
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::IdentityConfig;
use crate::middleware::{auth_middleware, metrics_middleware, protocol_auth_middleware};
use crate::services::{
    AccountLinks, Argon2Hasher, AuthService, AuthThrottles, CounterStore, CredentialManager,
    EmailSender, EventSink, FederationBridge, IdentityProvider, IdentityResolver, IdentityStore,
    LoginThrottle, RevocationStore, SecretHasher, SecurityEventRecorder, TokenIssuer,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::verify_email,
        handlers::auth::request_password_reset,
        handlers::auth::confirm_password_reset,
        handlers::federation::providers,
        handlers::federation::initiate,
        handlers::federation::consume_assertion,
        handlers::federation::metadata,
        handlers::account::get_profile,
        handlers::account::update_profile,
        handlers::account::change_password,
        handlers::account::delete_account,
        handlers::account::resend_verification,
        handlers::account::linked_providers,
        handlers::account::unlink_provider,
        handlers::credentials::create_credential,
        handlers::credentials::list_credentials,
        handlers::credentials::revoke_credential,
        handlers::credentials::remove_credential,
        handlers::protocol::principal,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::LoginRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::SessionResponse,
            dtos::auth::AssertionForm,
            dtos::auth::ProvidersResponse,
            dtos::auth::PasswordResetRequest,
            dtos::auth::PasswordResetConfirmRequest,
            dtos::account::UpdateProfileRequest,
            dtos::account::LinkedProvidersResponse,
            dtos::account::ChangePasswordRequest,
            dtos::account::DeleteAccountRequest,
            dtos::credential::CreateCredentialRequest,
            dtos::credential::CreatedCredentialResponse,
            dtos::credential::CredentialListResponse,
            dtos::credential::ProtocolPrincipal,
            models::AccountSummary,
            models::BindingView,
            models::CredentialView,
            models::CredentialScope,
            models::AccessLevel,
            models::ResourceKind,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Password sign-in and session tokens"),
        (name = "Federation", description = "SP-initiated federated sign-in"),
        (name = "Account", description = "Profile, password and account lifecycle"),
        (name = "Credentials", description = "Protocol credentials for non-interactive clients"),
        (name = "Protocol", description = "Endpoints guarded by protocol credentials"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "basic_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Basic).build()),
            );
        }
    }
}

/// Storage and provider collaborators chosen at startup.
pub struct Backends {
    pub store: Arc<dyn IdentityStore>,
    pub events: Arc<dyn EventSink>,
    pub revocations: Arc<dyn RevocationStore>,
    pub counters: Arc<dyn CounterStore>,
    pub providers: Vec<Arc<dyn IdentityProvider>>,
    pub email: Arc<dyn EmailSender>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub store: Arc<dyn IdentityStore>,
    pub revocations: Arc<dyn RevocationStore>,
    pub tokens: TokenIssuer,
    pub auth_service: AuthService,
    pub credentials: CredentialManager,
    pub federation: FederationBridge,
    pub ip_rate_limiter: IpRateLimiter,
    pub trusted_proxies: TrustedProxies,
}

impl AppState {
    /// Wires every service over the given backends. Fails when no signing key
    /// or hashing parameters are usable.
    pub fn new(config: IdentityConfig, backends: Backends) -> Result<Self, anyhow::Error> {
        let Backends {
            store,
            events,
            revocations,
            counters,
            providers,
            email,
        } = backends;

        let hasher: Arc<dyn SecretHasher> = Arc::new(Argon2Hasher::new(&config.hashing)?);
        let tokens = TokenIssuer::new(&config.jwt, revocations.clone())?;
        let recorder = SecurityEventRecorder::new(events);
        let resolver = IdentityResolver::new(store.clone());

        let throttles = &config.throttle;
        let login_throttle = LoginThrottle::new(counters.clone(), "login", throttles.login);
        let password_throttle =
            LoginThrottle::new(counters.clone(), "password_change", throttles.password_change);
        let reset_throttle =
            LoginThrottle::new(counters.clone(), "password_reset", throttles.password_reset);
        let protocol_throttle = LoginThrottle::new(counters.clone(), "protocol", throttles.protocol);
        let federation_throttle = LoginThrottle::new(counters, "federation", throttles.federation);

        let auth_service = AuthService::new(
            store.clone(),
            resolver.clone(),
            hasher.clone(),
            tokens.clone(),
            AuthThrottles {
                login: login_throttle,
                password_change: password_throttle,
                mailed_links: reset_throttle,
            },
            AccountLinks::from_config(&config, email),
            recorder.clone(),
        );
        let credentials =
            CredentialManager::new(store.clone(), hasher, protocol_throttle, recorder.clone());
        let federation = FederationBridge::new(
            &config.federation,
            providers,
            resolver,
            tokens.clone(),
            federation_throttle,
            recorder,
        );

        let ip_rate_limiter = create_ip_rate_limiter(
            config.security.global_ip_limit,
            config.security.global_ip_window_seconds,
        );
        let trusted_proxies = TrustedProxies::parse(&config.security.trusted_proxies)?;

        tracing::info!(
            providers = ?federation.provider_names(),
            "Identity services initialized"
        );

        Ok(Self {
            config,
            store,
            revocations,
            tokens,
            auth_service,
            credentials,
            federation,
            ip_rate_limiter,
            trusted_proxies,
        })
    }
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    let session_routes = Router::new()
        .route(
            "/users/me",
            get(handlers::account::get_profile)
                .patch(handlers::account::update_profile)
                .delete(handlers::account::delete_account),
        )
        .route(
            "/users/me/password",
            post(handlers::account::change_password),
        )
        .route(
            "/users/me/email-verification",
            post(handlers::account::resend_verification),
        )
        .route(
            "/users/me/providers",
            get(handlers::account::linked_providers),
        )
        .route(
            "/users/me/providers/:provider",
            delete(handlers::account::unlink_provider),
        )
        .route(
            "/credentials",
            post(handlers::credentials::create_credential)
                .get(handlers::credentials::list_credentials),
        )
        .route(
            "/credentials/:id",
            delete(handlers::credentials::revoke_credential),
        )
        .route(
            "/credentials/:id/history",
            delete(handlers::credentials::remove_credential),
        )
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let protocol_routes = Router::new()
        .route("/protocol/principal", get(handlers::protocol::principal))
        .layer(from_fn_with_state(state.clone(), protocol_auth_middleware));

    let allowed_origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(origin = %o, error = %e, "Skipping invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    let ip_limiter = state.ip_rate_limiter.clone();
    let trusted_proxies = state.trusted_proxies.clone();

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/verify-email", get(handlers::auth::verify_email))
        .route(
            "/auth/password-reset/request",
            post(handlers::auth::request_password_reset),
        )
        .route(
            "/auth/password-reset/confirm",
            post(handlers::auth::confirm_password_reset),
        )
        .route(
            "/auth/federation/providers",
            get(handlers::federation::providers),
        )
        .route(
            "/auth/federation/:provider/login",
            get(handlers::federation::initiate),
        )
        .route(
            "/auth/federation/:provider/acs",
            post(handlers::federation::consume_assertion),
        )
        .route(
            "/auth/federation/:provider/metadata",
            get(handlers::federation::metadata),
        )
        .merge(session_routes)
        .merge(protocol_routes)
        .with_state(state)
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(from_fn_with_state(trusted_proxies, client_ip_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Identity store health check failed");
        AppError::ServiceUnavailable
    })?;

    state.revocations.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Revocation store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "store": "up",
            "revocations": "up"
        }
    })))
}
