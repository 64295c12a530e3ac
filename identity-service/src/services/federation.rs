//! SP-initiated federated sign-in.
//!
//! Unauthenticated -> redirect to IdP -> AssertionReceived -> AttributesExtracted
//! -> Resolved -> TokensIssued. Nothing is persisted between the two legs; a
//! failure at any stage ends the flow with `FederationFailed`.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::attributes::{AttributeMap, AttributeMapper};
use super::auth::LoginOutcome;
use super::error::ServiceError;
use super::identity::IdentityResolver;
use super::jwt::TokenIssuer;
use super::metrics::record_auth_attempt;
use super::security_audit::SecurityEventRecorder;
use super::throttle::LoginThrottle;
use crate::config::{FederationConfig, FederationProviderConfig};
use crate::models::{ClientContext, SecurityEvent, SecurityEventKind};

/// Output of a successful assertion validation.
#[derive(Debug, Clone)]
pub struct ValidatedAssertion {
    pub subject: String,
    pub attributes: AttributeMap,
}

/// Identity-provider collaborator. Signature, certificate and clock checks
/// all happen inside `validate`.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn initiate_url(&self, relay_state: Option<&str>) -> String;

    async fn validate(&self, raw_response: &str) -> Result<ValidatedAssertion, anyhow::Error>;

    /// Service-provider metadata document for this provider, if it
    /// publishes one. `acs_url` is where assertions are posted back.
    fn metadata(&self, _acs_url: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    sub: String,
    #[serde(default)]
    attributes: HashMap<String, AttributeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AttributeValue {
    One(String),
    Many(Vec<String>),
}

/// Provider whose assertions arrive as HS256-signed compact tokens carrying
/// `sub`, `aud`, `exp` and an `attributes` object.
pub struct SignedAssertionProvider {
    name: String,
    sso_url: String,
    audience: String,
    key: DecodingKey,
}

impl SignedAssertionProvider {
    pub fn from_config(config: &FederationProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            sso_url: config.sso_url.clone(),
            audience: config.audience.clone(),
            key: DecodingKey::from_secret(config.verification_secret.expose_secret().as_bytes()),
        }
    }
}

#[async_trait]
impl IdentityProvider for SignedAssertionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn initiate_url(&self, relay_state: Option<&str>) -> String {
        let separator = if self.sso_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}audience={}",
            self.sso_url,
            separator,
            urlencoding::encode(&self.audience)
        );
        if let Some(state) = relay_state {
            url.push_str("&RelayState=");
            url.push_str(&urlencoding::encode(state));
        }
        url
    }

    async fn validate(&self, raw_response: &str) -> Result<ValidatedAssertion, anyhow::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        let claims = decode::<AssertionClaims>(raw_response.trim(), &self.key, &validation)
            .map_err(|e| anyhow::anyhow!("Assertion rejected: {}", e))?
            .claims;

        let attributes = claims
            .attributes
            .into_iter()
            .map(|(name, value)| match value {
                AttributeValue::One(v) => (name, vec![v]),
                AttributeValue::Many(vs) => (name, vs),
            })
            .collect();

        Ok(ValidatedAssertion {
            subject: claims.sub,
            attributes,
        })
    }

    fn metadata(&self, acs_url: &str) -> Option<String> {
        Some(format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>
"#,
            entity = xml_escape(&self.audience),
            acs = xml_escape(acs_url),
        ))
    }
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationStage {
    AssertionReceived,
    AttributesExtracted,
    Resolved,
    TokensIssued,
}

impl fmt::Display for FederationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FederationStage::AssertionReceived => "assertion_received",
            FederationStage::AttributesExtracted => "attributes_extracted",
            FederationStage::Resolved => "resolved",
            FederationStage::TokensIssued => "tokens_issued",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct FederationBridge {
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
    mapper: AttributeMapper,
    resolver: IdentityResolver,
    tokens: TokenIssuer,
    throttle: LoginThrottle,
    events: SecurityEventRecorder,
    expose_failure_detail: bool,
}

impl FederationBridge {
    pub fn new(
        config: &FederationConfig,
        providers: Vec<Arc<dyn IdentityProvider>>,
        resolver: IdentityResolver,
        tokens: TokenIssuer,
        throttle: LoginThrottle,
        events: SecurityEventRecorder,
    ) -> Self {
        let mapper = config
            .providers
            .iter()
            .filter_map(|p| p.email_attributes.clone().map(|aliases| (p.name.clone(), aliases)))
            .fold(AttributeMapper::new(), |mapper, (name, aliases)| {
                mapper.with_email_aliases(&name, aliases)
            });

        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
            mapper,
            resolver,
            tokens,
            throttle,
            events,
            expose_failure_detail: config.expose_failure_detail,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn IdentityProvider>, ServiceError> {
        self.providers.get(name).ok_or_else(|| {
            tracing::debug!(provider = name, "Unknown identity provider");
            ServiceError::Validation(format!("Unknown identity provider: {}", name))
        })
    }

    /// First leg: where to send the browser.
    pub fn initiate(&self, provider: &str, relay_state: Option<&str>) -> Result<String, ServiceError> {
        Ok(self.provider(provider)?.initiate_url(relay_state))
    }

    /// SP metadata for `provider`; `None` when the provider publishes none.
    pub fn metadata(&self, provider: &str, public_base_url: &str) -> Result<Option<String>, ServiceError> {
        let acs_url = format!(
            "{}/auth/federation/{}/acs",
            public_base_url,
            urlencoding::encode(provider)
        );
        Ok(self.provider(provider)?.metadata(&acs_url))
    }

    /// Second leg: consume the IdP response and open a session.
    #[tracing::instrument(skip(self, raw_response, ctx))]
    pub async fn complete(
        &self,
        provider: &str,
        raw_response: &str,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, ServiceError> {
        let idp = self.provider(provider)?;

        let ip_key = format!("ip:{}", ctx.ip_key());
        if let Err(e) = self.throttle.guard(&ip_key).await {
            record_auth_attempt("federation", "throttled");
            self.events.record(
                SecurityEvent::failed(SecurityEventKind::LoginThrottled)
                    .client(ctx)
                    .detail(format!("federation provider={}", provider)),
            );
            return Err(e);
        }

        let assertion = idp.validate(raw_response).await.map_err(|e| {
            self.fail(
                provider,
                FederationStage::AssertionReceived,
                e.to_string(),
                None,
                ctx,
            )
        })?;

        let identity = self
            .mapper
            .map(provider, &assertion.subject, &assertion.attributes)
            .map_err(|e| {
                self.fail(
                    provider,
                    FederationStage::AttributesExtracted,
                    e.to_string(),
                    Some(&assertion.subject),
                    ctx,
                )
            })?;

        let account = match self.resolver.resolve(provider, &identity).await {
            Ok(account) => account,
            Err(
                e @ (ServiceError::AccountInactive
                | ServiceError::EmailAlreadyRegistered
                | ServiceError::EmailNotVerified),
            ) => {
                return Err(self.fail(
                    provider,
                    FederationStage::Resolved,
                    e.to_string(),
                    Some(&identity.subject),
                    ctx,
                ))
            }
            Err(e) => {
                self.record_failure(
                    provider,
                    FederationStage::Resolved,
                    &e.to_string(),
                    Some(&identity.subject),
                    ctx,
                );
                return Err(e);
            }
        };

        let tokens = match self.tokens.issue_pair(&account).await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.record_failure(
                    provider,
                    FederationStage::TokensIssued,
                    &e.to_string(),
                    Some(&identity.subject),
                    ctx,
                );
                return Err(e);
            }
        };

        self.throttle.reset(&ip_key).await;
        record_auth_attempt("federation", "success");
        tracing::info!(
            stage = %FederationStage::TokensIssued,
            account_id = account.account_id,
            "Federated sign-in completed"
        );
        self.events.record(
            SecurityEvent::succeeded(SecurityEventKind::FederationSucceeded)
                .account(account.account_id)
                .client(ctx)
                .detail(format!("provider={} subject={}", provider, identity.subject)),
        );

        Ok(LoginOutcome { account, tokens })
    }

    /// Logs the full cause and returns the caller-facing error.
    fn fail(
        &self,
        provider: &str,
        stage: FederationStage,
        cause: String,
        subject: Option<&str>,
        ctx: &ClientContext,
    ) -> ServiceError {
        self.record_failure(provider, stage, &cause, subject, ctx);
        ServiceError::FederationFailed {
            detail: self.expose_failure_detail.then_some(cause),
        }
    }

    /// Log line, failure metric and security event for a flow that stopped
    /// at `stage`.
    fn record_failure(
        &self,
        provider: &str,
        stage: FederationStage,
        cause: &str,
        subject: Option<&str>,
        ctx: &ClientContext,
    ) {
        tracing::warn!(provider, stage = %stage, cause = %cause, "Federated sign-in failed");
        record_auth_attempt("federation", "failure");

        let mut event = SecurityEvent::failed(SecurityEventKind::FederationFailed)
            .client(ctx)
            .detail(format!("provider={} stage={} cause={}", provider, stage, cause));
        if let Some(subject) = subject {
            event = event.subject(subject);
        }
        self.events.record(event);
    }
}
