//! Shared harness for identity-service integration tests.
//!
//! Everything runs in-process on the memory backends; no PostgreSQL or Redis
//! is needed.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use identity_service::{
    build_router,
    config::{
        DatabaseConfig, EmailConfig, Environment, FederationConfig, HashingConfig, IdentityConfig,
        JwtConfig, RedisConfig, SecurityConfig, StorageBackend, ThrottleConfig,
        ThrottlePolicyConfig,
    },
    services::{
        AttributeMap, EmailSender, IdentityProvider, IdentityStore, InMemoryStore,
        MemoryCounterStore, MemoryRevocationStore, RevocationStore, ValidatedAssertion,
    },
    AppState, Backends,
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;

pub const PROVIDER: &str = "corp-sso";
pub const PASSWORD: &str = "Str0ng!pass";
pub const PEER: ([u8; 4], u16) = ([203, 0, 113, 7], 40000);

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        public_base_url: "https://id.example.test".to_string(),
        backend: StorageBackend::Memory,
        database: DatabaseConfig {
            url: "postgres://localhost/identity_test".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        jwt: JwtConfig {
            private_key_path: None,
            public_key_path: None,
            secret: Some(SecretString::new(
                "integration-test-signing-secret-0123456789".to_string(),
            )),
            issuer: "identity-service".to_string(),
            access_token_expiry_minutes: 10,
            refresh_token_expiry_days: 7,
        },
        hashing: HashingConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        },
        throttle: ThrottleConfig {
            login: ThrottlePolicyConfig {
                max_attempts: 5,
                window_seconds: 60,
            },
            password_change: ThrottlePolicyConfig {
                max_attempts: 3,
                window_seconds: 3600,
            },
            password_reset: ThrottlePolicyConfig {
                max_attempts: 3,
                window_seconds: 3600,
            },
            protocol: ThrottlePolicyConfig {
                max_attempts: 5,
                window_seconds: 60,
            },
            federation: ThrottlePolicyConfig {
                max_attempts: 20,
                window_seconds: 60,
            },
        },
        federation: FederationConfig {
            expose_failure_detail: false,
            providers: Vec::new(),
        },
        email: EmailConfig {
            from_address: "no-reply@example.test".to_string(),
            smtp: None,
            verification_ttl_hours: 24,
            password_reset_ttl_minutes: 60,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            trusted_proxies: Vec::new(),
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        },
    }
}

#[derive(Deserialize)]
struct MockAssertion {
    subject: String,
    #[serde(default)]
    attributes: AttributeMap,
}

/// Accepts a JSON body `{"subject": .., "attributes": {..}}` as a valid
/// assertion. Anything that does not parse is rejected.
pub struct MockIdentityProvider;

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn initiate_url(&self, relay_state: Option<&str>) -> String {
        match relay_state {
            Some(state) => format!("https://idp.test/sso?RelayState={}", state),
            None => "https://idp.test/sso".to_string(),
        }
    }

    async fn validate(&self, raw_response: &str) -> Result<ValidatedAssertion, anyhow::Error> {
        let parsed: MockAssertion = serde_json::from_str(raw_response)
            .map_err(|e| anyhow::anyhow!("signature check failed: {}", e))?;
        Ok(ValidatedAssertion {
            subject: parsed.subject,
            attributes: parsed.attributes,
        })
    }
}

pub fn assertion(subject: &str, email: Option<&str>) -> String {
    let mut attributes = serde_json::Map::new();
    if let Some(email) = email {
        attributes.insert("mail".to_string(), serde_json::json!([email]));
    }
    attributes.insert("displayName".to_string(), serde_json::json!(["Federated User"]));
    serde_json::json!({ "subject": subject, "attributes": attributes }).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    Verification,
    PasswordReset,
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub kind: MailKind,
    pub to: String,
    pub link: String,
}

/// Keeps every outgoing mail so tests can follow the links.
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingEmailSender {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    /// Token from the newest mail of `kind` sent to `to`.
    pub fn last_token(&self, kind: MailKind, to: &str) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.kind == kind && m.to == to)
            .and_then(|m| m.link.split("token=").nth(1).map(str::to_string))
    }

    fn push(&self, kind: MailKind, to: &str, link: &str) {
        self.sent.lock().unwrap().push(SentMail {
            kind,
            to: to.to_string(),
            link: link.to_string(),
        });
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send_verification_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        self.push(MailKind::Verification, to, link);
        Ok(())
    }

    async fn send_password_reset_email(&self, to: &str, link: &str) -> Result<(), anyhow::Error> {
        self.push(MailKind::PasswordReset, to, link);
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub mail: Arc<RecordingEmailSender>,
    pub router: Router,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut IdentityConfig)) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_backends(adjust, store.clone(), store, Arc::new(MemoryRevocationStore::new()))
    }

    /// Like [`with_config`](Self::with_config) but with the identity store
    /// and revocation store supplied by the test. `memory` still receives
    /// security events.
    pub fn with_backends(
        adjust: impl FnOnce(&mut IdentityConfig),
        memory: Arc<InMemoryStore>,
        store: Arc<dyn IdentityStore>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        let mut config = test_config();
        adjust(&mut config);

        let mail = Arc::new(RecordingEmailSender::default());
        let backends = Backends {
            store,
            events: memory.clone(),
            revocations,
            counters: Arc::new(MemoryCounterStore::new()),
            providers: vec![Arc::new(MockIdentityProvider)],
            email: mail.clone(),
        };
        let state = AppState::new(config, backends).expect("app state");
        let router = build_router(state.clone()).expect("router");

        Self {
            state,
            store: memory,
            mail,
            router,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        self.send_from(SocketAddr::from(PEER), request).await
    }

    /// Sends `request` as if it arrived on a socket from `peer`.
    pub async fn send_from(&self, peer: SocketAddr, mut request: Request<Body>) -> TestResponse {
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        bearer: Option<&str>,
        body: Value,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn get_basic(&self, uri: &str, username: &str, secret: &str) -> TestResponse {
        let encoded = STANDARD.encode(format!("{}:{}", username, secret));
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_form(&self, uri: &str, form: &[(&str, &str)]) -> TestResponse {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    /// Registers `email` with [`PASSWORD`] and returns the session body.
    pub async fn register(&self, email: &str) -> Value {
        let res = self
            .json(
                "POST",
                "/auth/register",
                None,
                serde_json::json!({ "email": email, "password": PASSWORD }),
            )
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "register: {}", res.body);
        res.body
    }

    /// Follows the newest verification link mailed to `email`.
    pub async fn verify_email(&self, email: &str) -> TestResponse {
        let token = self
            .mail
            .last_token(MailKind::Verification, email)
            .expect("verification mail");
        self.get(&format!("/auth/verify-email?token={}", token), None)
            .await
    }

    /// Creates a credential for the bearer and returns `(username, secret, id)`.
    pub async fn create_credential(&self, bearer: &str, body: Value) -> (String, String, String) {
        let res = self.json("POST", "/credentials", Some(bearer), body).await;
        assert_eq!(res.status, StatusCode::CREATED, "create: {}", res.body);
        (
            res.body["credential"]["username"].as_str().unwrap().to_string(),
            res.body["secret"].as_str().unwrap().to_string(),
            res.body["credential"]["id"].as_str().unwrap().to_string(),
        )
    }
}

pub fn access_token(session: &Value) -> String {
    session["access_token"].as_str().unwrap().to_string()
}

pub fn refresh_token(session: &Value) -> String {
    session["refresh_token"].as_str().unwrap().to_string()
}
