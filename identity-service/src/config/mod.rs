use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::middleware::rate_limit::TrustedProxies;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Externally reachable origin, used in mailed links and SP metadata.
    pub public_base_url: String,
    pub backend: StorageBackend,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub hashing: HashingConfig,
    pub throttle: ThrottleConfig,
    pub federation: FederationConfig,
    pub email: EmailConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

/// Where accounts, counters and revocations live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageBackend {
    /// PostgreSQL for records, Redis for counters and the revocation set.
    Postgres,
    /// Process-local maps. Dev and tests only.
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Token signing. Either an RS256 key pair on disk or an HS256 shared secret.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub private_key_path: Option<String>,
    pub public_key_path: Option<String>,
    pub secret: Option<SecretString>,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

/// Argon2id cost parameters for passwords and credential secrets.
#[derive(Debug, Clone)]
pub struct HashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicyConfig {
    pub max_attempts: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub login: ThrottlePolicyConfig,
    pub password_change: ThrottlePolicyConfig,
    /// Password-reset requests and verification resends, keyed by address.
    pub password_reset: ThrottlePolicyConfig,
    pub protocol: ThrottlePolicyConfig,
    pub federation: ThrottlePolicyConfig,
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Echo the validator's failure reason to the caller. Off by default.
    pub expose_failure_detail: bool,
    pub providers: Vec<FederationProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct FederationProviderConfig {
    pub name: String,
    pub sso_url: String,
    pub audience: String,
    pub verification_secret: SecretString,
    pub email_attributes: Option<Vec<String>>,
}

/// Verification and password-reset mail. Without SMTP settings the links
/// are written to the log instead of being sent.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub from_address: String,
    pub smtp: Option<SmtpConfig>,
    pub verification_ttl_hours: i64,
    pub password_reset_ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Peers (addresses or CIDR blocks) whose `X-Forwarded-For` is honoured.
    pub trusted_proxies: Vec<String>,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: optional_env("OTLP_ENDPOINT"),
            public_base_url: get_env("PUBLIC_BASE_URL", Some("http://localhost:8080"), is_prod)?
                .trim_end_matches('/')
                .to_string(),
            backend: parse(get_env("STORAGE_BACKEND", Some("postgres"), is_prod)?, "STORAGE_BACKEND")?,
            database: DatabaseConfig {
                url: get_env(
                    "DATABASE_URL",
                    Some("postgres://localhost/identity"),
                    is_prod,
                )?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: optional_env("JWT_PRIVATE_KEY_PATH"),
                public_key_path: optional_env("JWT_PUBLIC_KEY_PATH"),
                secret: optional_env("JWT_SECRET").map(SecretString::new),
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "10",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
            },
            hashing: HashingConfig {
                memory_kib: parse_env("ARGON2_MEMORY_KIB", "19456", is_prod)?,
                iterations: parse_env("ARGON2_ITERATIONS", "2", is_prod)?,
                parallelism: parse_env("ARGON2_PARALLELISM", "1", is_prod)?,
            },
            throttle: ThrottleConfig {
                login: policy_env("LOGIN", 5, 60, is_prod)?,
                password_change: policy_env("PASSWORD_CHANGE", 3, 3600, is_prod)?,
                password_reset: policy_env("PASSWORD_RESET", 3, 3600, is_prod)?,
                protocol: policy_env("PROTOCOL", 10, 60, is_prod)?,
                federation: policy_env("FEDERATION", 20, 60, is_prod)?,
            },
            federation: FederationConfig {
                expose_failure_detail: parse_env(
                    "FEDERATION_EXPOSE_FAILURE_DETAIL",
                    "false",
                    is_prod,
                )?,
                providers: federation_providers_env()?,
            },
            email: EmailConfig {
                from_address: get_env("EMAIL_FROM", Some("no-reply@localhost"), is_prod)?,
                smtp: smtp_env()?,
                verification_ttl_hours: parse_env("EMAIL_VERIFICATION_TTL_HOURS", "24", is_prod)?,
                password_reset_ttl_minutes: parse_env(
                    "PASSWORD_RESET_TTL_MINUTES",
                    "60",
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                trusted_proxies: optional_env("TRUSTED_PROXIES")
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "100", is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    "60",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.jwt.access_token_expiry_minutes >= self.jwt.refresh_token_expiry_days * 24 * 60 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Access token lifetime must be shorter than refresh token lifetime"
            )));
        }

        let has_key_pair =
            self.jwt.private_key_path.is_some() && self.jwt.public_key_path.is_some();
        if !has_key_pair && self.jwt.secret.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Either JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH or JWT_SECRET must be set"
            )));
        }

        for (name, policy) in [
            ("LOGIN", self.throttle.login),
            ("PASSWORD_CHANGE", self.throttle.password_change),
            ("PASSWORD_RESET", self.throttle.password_reset),
            ("PROTOCOL", self.throttle.protocol),
            ("FEDERATION", self.throttle.federation),
        ] {
            if policy.max_attempts == 0 || policy.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "THROTTLE_{}_ATTEMPTS and THROTTLE_{}_WINDOW_SECONDS must be positive",
                    name,
                    name
                )));
            }
        }

        if self.email.verification_ttl_hours <= 0 || self.email.password_reset_ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "EMAIL_VERIFICATION_TTL_HOURS and PASSWORD_RESET_TTL_MINUTES must be positive"
            )));
        }

        if !self.public_base_url.starts_with("http://") && !self.public_base_url.starts_with("https://")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PUBLIC_BASE_URL must be an http(s) URL"
            )));
        }

        TrustedProxies::parse(&self.security.trusted_proxies)?;

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.backend == StorageBackend::Memory {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORAGE_BACKEND=memory is not allowed in production"
                )));
            }

            if self.email.smtp.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "SMTP_HOST is required in production"
                )));
            }

            if self.federation.expose_failure_detail {
                tracing::warn!("Federation failure details are exposed to callers in production");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T>(raw: String, key: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", key, e))
    })
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse(get_env(key, Some(default), is_prod)?, key)
}

fn policy_env(
    name: &str,
    attempts: u32,
    window_seconds: u64,
    is_prod: bool,
) -> Result<ThrottlePolicyConfig, AppError> {
    Ok(ThrottlePolicyConfig {
        max_attempts: parse_env(
            &format!("THROTTLE_{}_ATTEMPTS", name),
            &attempts.to_string(),
            is_prod,
        )?,
        window_seconds: parse_env(
            &format!("THROTTLE_{}_WINDOW_SECONDS", name),
            &window_seconds.to_string(),
            is_prod,
        )?,
    })
}

/// `FEDERATION_PROVIDERS=corp-sso,partner` then `FEDERATION_CORP_SSO_SSO_URL`,
/// `..._AUDIENCE`, `..._VERIFICATION_SECRET` and optional `..._EMAIL_ATTRIBUTES`.
fn federation_providers_env() -> Result<Vec<FederationProviderConfig>, AppError> {
    let Some(names) = optional_env("FEDERATION_PROVIDERS") else {
        return Ok(Vec::new());
    };

    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|name| {
            let prefix = format!(
                "FEDERATION_{}",
                name.to_ascii_uppercase().replace('-', "_")
            );
            Ok(FederationProviderConfig {
                name: name.to_string(),
                sso_url: get_env(&format!("{}_SSO_URL", prefix), None, true)?,
                audience: get_env(&format!("{}_AUDIENCE", prefix), None, true)?,
                verification_secret: SecretString::new(get_env(
                    &format!("{}_VERIFICATION_SECRET", prefix),
                    None,
                    true,
                )?),
                email_attributes: optional_env(&format!("{}_EMAIL_ATTRIBUTES", prefix)).map(
                    |raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    },
                ),
            })
        })
        .collect()
}

/// `SMTP_HOST` switches mail delivery on; the remaining keys are then required.
fn smtp_env() -> Result<Option<SmtpConfig>, AppError> {
    let Some(host) = optional_env("SMTP_HOST") else {
        return Ok(None);
    };
    Ok(Some(SmtpConfig {
        host,
        port: parse(get_env("SMTP_PORT", Some("587"), false)?, "SMTP_PORT")?,
        username: get_env("SMTP_USERNAME", None, false)?,
        password: SecretString::new(get_env("SMTP_PASSWORD", None, false)?),
    }))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> IdentityConfig {
        IdentityConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "identity-service".to_string(),
            service_version: "test".to_string(),
            log_level: "error".to_string(),
            otlp_endpoint: None,
            public_base_url: "http://localhost:8080".to_string(),
            backend: StorageBackend::Memory,
            database: DatabaseConfig {
                url: "postgres://localhost/identity_test".to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            jwt: JwtConfig {
                private_key_path: None,
                public_key_path: None,
                secret: Some(SecretString::new("x".repeat(32))),
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
                    max_attempts: 10,
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
                from_address: "no-reply@example.com".to_string(),
                smtp: None,
                verification_ttl_hours: 24,
                password_reset_ttl_minutes: 60,
            },
            security: SecurityConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
                trusted_proxies: Vec::new(),
                global_ip_limit: 100,
                global_ip_window_seconds: 60,
            },
        }
    }

    #[test]
    fn base_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn access_lifetime_must_be_shorter_than_refresh() {
        let mut config = base_config();
        config.jwt.access_token_expiry_minutes = 7 * 24 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn a_signing_key_source_is_required() {
        let mut config = base_config();
        config.jwt.secret = None;
        config.jwt.private_key_path = Some("/keys/private.pem".to_string());
        assert!(config.validate().is_err());

        config.jwt.public_key_path = Some("/keys/public.pem".to_string());
        assert!(config.validate().is_ok());
    }

    fn smtp() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "mailer".to_string(),
            password: SecretString::new("app-password".to_string()),
        }
    }

    #[test]
    fn production_rejects_memory_backend_and_wildcard_cors() {
        let mut config = base_config();
        config.environment = Environment::Prod;
        config.email.smtp = Some(smtp());
        assert!(config.validate().is_err());

        config.backend = StorageBackend::Postgres;
        assert!(config.validate().is_ok());

        config.security.allowed_origins = vec!["*".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_requires_mail_delivery() {
        let mut config = base_config();
        config.environment = Environment::Prod;
        config.backend = StorageBackend::Postgres;
        assert!(config.validate().is_err());

        config.email.smtp = Some(smtp());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn public_base_url_must_be_http() {
        let mut config = base_config();
        config.public_base_url = "ftp://id.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_trusted_proxy_is_rejected() {
        let mut config = base_config();
        config.security.trusted_proxies = vec!["10.0.0.0/8".to_string(), "proxy.local".to_string()];
        assert!(config.validate().is_err());

        config.security.trusted_proxies.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_attempt_policy_is_rejected() {
        let mut config = base_config();
        config.throttle.protocol.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
