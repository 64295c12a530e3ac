pub mod account;
pub mod account_token;
pub mod binding;
pub mod client;
pub mod credential;
pub mod security_event;

pub use account::{Account, AccountSummary, NewAccount};
pub use account_token::{AccountToken, TokenPurpose};
pub use binding::{AuthenticationBinding, BindingView, NewBinding};
pub use client::ClientContext;
pub use credential::{
    AccessLevel, Credential, CredentialScope, CredentialStatus, CredentialView, ResourceKind,
};
pub use security_event::{SecurityEvent, SecurityEventKind};
