use std::net::IpAddr;

/// Who is on the other end of a request, as far as the transport can tell.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn new(ip: Option<IpAddr>, user_agent: Option<String>) -> Self {
        Self { ip, user_agent }
    }

    /// Throttle key component for the client address.
    pub fn ip_key(&self) -> String {
        match self.ip {
            Some(ip) => ip.to_string(),
            None => "unknown".to_string(),
        }
    }
}
