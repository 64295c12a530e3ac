use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Extensions, HeaderMap},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use ipnetwork::IpNetwork;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// Coarse request ceiling keyed by client IP.
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

/// Create an IP-keyed limiter allowing `attempts` requests per `window_seconds`.
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    let attempts = NonZeroU32::new(attempts.max(1)).unwrap_or(NonZeroU32::MIN);
    let period_ms = (window_seconds.max(1) * 1000) / u64::from(attempts.get());
    let quota = Quota::with_period(Duration::from_millis(period_ms.max(1)))
        .unwrap_or_else(|| Quota::per_second(attempts))
        .allow_burst(attempts);

    Arc::new(RateLimiter::dashmap(quota))
}

/// Reverse proxies allowed to report the client address in `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Arc<[IpNetwork]>,
}

impl TrustedProxies {
    /// Parses addresses or CIDR blocks such as `10.0.0.0/8` or `127.0.0.1`.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, AppError> {
        let networks = entries
            .iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                entry.parse::<IpNetwork>().map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Invalid trusted proxy {}: {}", entry, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            networks: networks.into(),
        })
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    /// Client address for a request arriving from `peer`. The forwarded
    /// chain is only consulted when the peer itself is trusted, and then
    /// the right-most hop that is not a trusted proxy wins.
    pub fn resolve(&self, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
        if !self.is_trusted(peer) {
            return peer;
        }
        let Some(chain) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        else {
            return peer;
        };

        let mut client = peer;
        for hop in chain.rsplit(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) if self.is_trusted(ip) => client = ip,
                Ok(ip) => return ip,
                Err(_) => return client,
            }
        }
        client
    }
}

/// Caller address resolved once per request by [`client_ip_middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Resolves the caller address against the trusted proxy list and stores it
/// as a [`ClientIp`] request extension.
pub async fn client_ip_middleware(
    State(proxies): State<TrustedProxies>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if let Some(peer) = peer {
        let ip = proxies.resolve(request.headers(), peer);
        request.extensions_mut().insert(ClientIp(ip));
    }
    next.run(request).await
}

/// Caller address: the resolved [`ClientIp`], else the socket peer.
/// Forwarding headers are never read here.
pub fn client_ip(extensions: &Extensions) -> Option<IpAddr> {
    extensions
        .get::<ClientIp>()
        .map(|ClientIp(ip)| *ip)
        .or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(request.extensions()) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs().max(1)),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn forwarded(chain: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(chain));
        headers
    }

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn forwarded_header_from_untrusted_peer_is_ignored() {
        let proxies = TrustedProxies::parse(&["10.0.0.0/8"]).unwrap();
        assert_eq!(
            proxies.resolve(&forwarded("203.0.113.9, 10.0.0.1"), ip("198.51.100.4")),
            ip("198.51.100.4")
        );

        let none = TrustedProxies::default();
        assert_eq!(
            none.resolve(&forwarded("203.0.113.9"), ip("127.0.0.1")),
            ip("127.0.0.1")
        );
    }

    #[test]
    fn rightmost_untrusted_hop_wins_behind_trusted_proxy() {
        let proxies = TrustedProxies::parse(&["10.0.0.0/8", "192.0.2.1"]).unwrap();
        // The left-most entry is whatever the client sent and is skipped.
        assert_eq!(
            proxies.resolve(
                &forwarded("1.2.3.4, 203.0.113.9, 10.1.1.1"),
                ip("192.0.2.1")
            ),
            ip("203.0.113.9")
        );
        assert_eq!(
            proxies.resolve(&HeaderMap::new(), ip("10.0.0.5")),
            ip("10.0.0.5")
        );
        assert_eq!(
            proxies.resolve(&forwarded("garbage, 10.2.2.2"), ip("10.0.0.5")),
            ip("10.2.2.2")
        );
    }

    #[test]
    fn invalid_proxy_entry_is_a_config_error() {
        assert!(TrustedProxies::parse(&["10.0.0.0/33"]).is_err());
        assert!(TrustedProxies::parse(&["not-an-ip"]).is_err());
    }

    #[test]
    fn resolved_address_wins_over_peer() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        extensions.insert(ClientIp(ip("203.0.113.9")));

        assert_eq!(client_ip(&extensions), Some(ip("203.0.113.9")));
    }

    #[test]
    fn falls_back_to_peer_address() {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 7], 4000))));

        assert_eq!(client_ip(&extensions), Some(ip("192.0.2.7")));
    }

    #[test]
    fn limiter_blocks_after_burst() {
        let limiter = create_ip_rate_limiter(2, 60);
        let ip: IpAddr = "198.51.100.1".parse().unwrap();

        assert!(limiter.check_key(&ip).is_ok());
        assert!(limiter.check_key(&ip).is_ok());
        assert!(limiter.check_key(&ip).is_err());
    }
}
