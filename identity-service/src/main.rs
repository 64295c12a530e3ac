use identity_service::{
    build_router,
    config::{IdentityConfig, StorageBackend},
    db,
    services::{
        metrics::init_metrics, Database, EmailSender, IdentityProvider, InMemoryStore,
        LogEmailSender, MemoryCounterStore, MemoryRevocationStore, RedisService,
        SignedAssertionProvider, SmtpEmailSender,
    },
    AppState, Backends,
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on invalid configuration
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    init_metrics().map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        backend = ?config.backend,
        "Starting identity service"
    );

    let providers: Vec<Arc<dyn IdentityProvider>> = config
        .federation
        .providers
        .iter()
        .map(|p| Arc::new(SignedAssertionProvider::from_config(p)) as Arc<dyn IdentityProvider>)
        .collect();

    let email: Arc<dyn EmailSender> =
        match SmtpEmailSender::from_config(&config.email).map_err(AppError::ConfigError)? {
            Some(smtp) => Arc::new(smtp),
            None => {
                tracing::warn!("SMTP not configured; account links are logged instead of mailed");
                Arc::new(LogEmailSender)
            }
        };

    let backends = match config.backend {
        StorageBackend::Postgres => {
            let pool = db::connect(&config.database)
                .await
                .map_err(AppError::DatabaseError)?;
            let database = Arc::new(Database::new(pool));

            let redis = Arc::new(
                RedisService::new(&config.redis)
                    .await
                    .map_err(AppError::InternalError)?,
            );
            tracing::info!("PostgreSQL and Redis backends ready");

            Backends {
                store: database.clone(),
                events: database,
                revocations: redis.clone(),
                counters: redis,
                providers,
                email,
            }
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; all state is lost on restart");
            let store = Arc::new(InMemoryStore::new());
            Backends {
                store: store.clone(),
                events: store,
                revocations: Arc::new(MemoryRevocationStore::new()),
                counters: Arc::new(MemoryCounterStore::new()),
                providers,
                email,
            }
        }
    };

    let state = AppState::new(config.clone(), backends).map_err(AppError::ConfigError)?;
    let app = build_router(state)?;

    let addr = config.common.bind_addr();

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
