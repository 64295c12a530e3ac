pub mod auth;
pub mod client;
pub mod metrics;
pub mod protocol;

pub use auth::{auth_middleware, AuthClaims, CurrentAccount};
pub use metrics::metrics_middleware;
pub use protocol::{protocol_auth_middleware, BASIC_CHALLENGE};
