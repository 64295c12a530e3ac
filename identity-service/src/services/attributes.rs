//! Normalizes federated attribute bags into a canonical identity.

use std::collections::HashMap;
use validator::ValidateEmail;

use super::error::ServiceError;

/// Raw attribute bag as handed over by an assertion validator.
pub type AttributeMap = HashMap<String, Vec<String>>;

const EMAIL_ALIASES: &[&str] = &[
    "mail",
    "email",
    "emailAddress",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
    "urn:oid:0.9.2342.19200300.100.1.3",
];

const DISPLAY_NAME_ALIASES: &[&str] = &[
    "displayName",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name",
    "urn:oid:2.16.840.1.113730.3.1.241",
];

const GIVEN_NAME_ALIASES: &[&str] = &[
    "givenName",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname",
    "urn:oid:2.5.4.42",
];

const SURNAME_ALIASES: &[&str] = &[
    "sn",
    "surname",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname",
    "urn:oid:2.5.4.4",
];

/// Provider-independent identity triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalIdentity {
    pub subject: String,
    /// Lowercased.
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeMapper {
    email_overrides: HashMap<String, Vec<String>>,
}

impl AttributeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the email alias list for one provider.
    pub fn with_email_aliases(mut self, provider: &str, aliases: Vec<String>) -> Self {
        self.email_overrides.insert(provider.to_string(), aliases);
        self
    }

    pub fn map(
        &self,
        provider: &str,
        subject: &str,
        attributes: &AttributeMap,
    ) -> Result<CanonicalIdentity, ServiceError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(ServiceError::MissingRequiredAttribute("subject".to_string()));
        }

        let email = match self.email_overrides.get(provider) {
            Some(aliases) => first_email(attributes, aliases.iter().map(String::as_str)),
            None => first_email(attributes, EMAIL_ALIASES.iter().copied()),
        }
        .ok_or_else(|| {
            tracing::warn!(provider, "Assertion carries no usable email attribute");
            ServiceError::MissingRequiredAttribute("email".to_string())
        })?;

        let display_name = first_value(attributes, DISPLAY_NAME_ALIASES.iter().copied())
            .or_else(|| {
                let given = first_value(attributes, GIVEN_NAME_ALIASES.iter().copied());
                let surname = first_value(attributes, SURNAME_ALIASES.iter().copied());
                match (given, surname) {
                    (Some(g), Some(s)) => Some(format!("{} {}", g, s)),
                    (Some(g), None) => Some(g),
                    (None, Some(s)) => Some(s),
                    (None, None) => None,
                }
            })
            .unwrap_or_else(|| subject.to_string());

        Ok(CanonicalIdentity {
            subject: subject.to_string(),
            email,
            display_name,
        })
    }
}

/// Values for `alias`. An exact-case attribute name wins; otherwise the
/// first case-insensitive match in name order.
fn values_for<'a>(attributes: &'a AttributeMap, alias: &str) -> Vec<&'a str> {
    let values = attributes.get(alias).or_else(|| {
        attributes
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(alias))
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, values)| values)
    });
    values
        .map(|vs| vs.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

fn first_value<'a>(
    attributes: &AttributeMap,
    aliases: impl Iterator<Item = &'a str>,
) -> Option<String> {
    aliases
        .flat_map(|alias| values_for(attributes, alias))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn first_email<'a>(
    attributes: &AttributeMap,
    aliases: impl Iterator<Item = &'a str>,
) -> Option<String> {
    aliases
        .flat_map(|alias| values_for(attributes, alias))
        .map(|v| v.trim().to_lowercase())
        .find(|v| v.validate_email())
}
