//! Identity core: account resolution, sessions, protocol credentials,
//! throttling and the security event log.

pub mod attributes;
pub mod auth;
pub mod credentials;
mod database;
pub mod email;
pub mod error;
pub mod federation;
pub mod hasher;
pub mod identity;
pub mod jwt;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod revocation;
pub mod security_audit;
pub mod store;
pub mod throttle;

pub use attributes::{AttributeMap, AttributeMapper, CanonicalIdentity};
pub use auth::{AccountLinks, AuthService, AuthThrottles, LoginOutcome, DELETE_CONFIRMATION};
pub use credentials::{CredentialManager, IssuedCredential, NewCredential, VerifiedCredential};
pub use database::Database;
pub use email::{EmailSender, LogEmailSender, SmtpEmailSender};
pub use error::ServiceError;
pub use federation::{
    FederationBridge, IdentityProvider, SignedAssertionProvider, ValidatedAssertion,
};
pub use hasher::{Argon2Hasher, SecretHasher};
pub use identity::IdentityResolver;
pub use jwt::{TokenClaims, TokenIssuer, TokenKind, TokenPair};
pub use memory::InMemoryStore;
pub use redis::RedisService;
pub use revocation::{MemoryRevocationStore, RevocationStore};
pub use security_audit::SecurityEventRecorder;
pub use store::{EventSink, IdentityStore, StoreError};
pub use throttle::{CounterStore, LoginThrottle, MemoryCounterStore, ThrottleDecision};
