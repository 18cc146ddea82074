use axum::http::HeaderMap;
use axum::http::header::HeaderName;
use std::net::{IpAddr, SocketAddr};

// Who a request counts against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Address(IpAddr),
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::User(_))
    }

    // Rendered form used as the throttle identity
    pub fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::Address(ip) => format!("ip:{}", ip),
        }
    }
}

// How to read identities off incoming requests
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    pub user_header: HeaderName,
    // X-Forwarded-For is client-controlled unless a trusted proxy rewrites it
    pub trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(user_header: HeaderName, trust_forwarded_for: bool) -> Self {
        Self {
            user_header,
            trust_forwarded_for,
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<Identity> {
        let user = headers
            .get(&self.user_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(user) = user {
            return Some(Identity::User(user.to_string()));
        }

        if self.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return Some(Identity::Address(ip));
            }
        }

        peer.map(|addr| Identity::Address(addr.ip()))
    }
}
