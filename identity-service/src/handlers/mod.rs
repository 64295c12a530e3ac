//! HTTP handlers for the identity service.

pub mod account;
pub mod auth;
pub mod credentials;
pub mod federation;
pub mod metrics;
pub mod protocol;
