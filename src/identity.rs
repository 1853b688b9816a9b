//! Identity keys for admission checks.
//!
//! The limiters treat a key as an opaque partition string; these extractors
//! decide what that string is for a request.

use axum::{body::Body, extract::ConnectInfo};
use http::{HeaderMap, Request};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

/// Authenticated caller, attached as a request extension by the auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Derives the identity key for a request.
///
/// `None` means this layer does not limit the request.
pub trait IdentityExtractor: Send + Sync {
    fn identity(&self, request: &Request<Body>) -> Option<String>;
}

/// Keys requests by client address: `ip:<addr>`
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIp;

impl IdentityExtractor for ClientIp {
    fn identity(&self, request: &Request<Body>) -> Option<String> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        client_ip(request.headers(), peer).map(|ip| format!("ip:{}", ip))
    }
}

/// Keys requests by authenticated principal: `user:<id>`
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalKey;

impl IdentityExtractor for PrincipalKey {
    fn identity(&self, request: &Request<Body>) -> Option<String> {
        principal(request).map(|id| format!("user:{}", id))
    }
}

/// Keys requests by principal and path: `user:<id>:<path>`
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalRouteKey;

impl IdentityExtractor for PrincipalRouteKey {
    fn identity(&self, request: &Request<Body>) -> Option<String> {
        principal(request).map(|id| format!("user:{}:{}", id, request.uri().path()))
    }
}

fn principal(request: &Request<Body>) -> Option<&str> {
    request
        .extensions()
        .get::<Principal>()
        .map(|p| p.0.as_str())
        .filter(|id| !id.is_empty())
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

/// What a route's limit is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Ip,
    User,
    UserRoute,
}

impl Scope {
    pub fn extractor(self) -> Arc<dyn IdentityExtractor> {
        match self {
            Scope::Ip => Arc::new(ClientIp),
            Scope::User => Arc::new(PrincipalKey),
            Scope::UserRoute => Arc::new(PrincipalRouteKey),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let mut req = request("/users/login");
        req.headers_mut()
            .insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        req.headers_mut().insert("x-real-ip", "198.51.100.1".parse().unwrap());

        assert_eq!(ClientIp.identity(&req), Some("ip:203.0.113.7".to_string()));
    }

    #[test]
    fn test_real_ip_then_peer() {
        let mut req = request("/");
        req.headers_mut().insert("x-real-ip", "198.51.100.1".parse().unwrap());
        assert_eq!(ClientIp.identity(&req), Some("ip:198.51.100.1".to_string()));

        let mut req = request("/");
        let peer: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(ClientIp.identity(&req), Some("ip:127.0.0.1".to_string()));
    }

    #[test]
    fn test_no_address_means_no_identity() {
        assert_eq!(ClientIp.identity(&request("/")), None);
    }

    #[test]
    fn test_principal_keys() {
        let mut req = request("/users/update");
        req.extensions_mut().insert(Principal("42".to_string()));

        assert_eq!(PrincipalKey.identity(&req), Some("user:42".to_string()));
        assert_eq!(
            PrincipalRouteKey.identity(&req),
            Some("user:42:/users/update".to_string())
        );
    }

    #[test]
    fn test_missing_principal() {
        let req = request("/users/update");
        assert_eq!(PrincipalKey.identity(&req), None);

        let mut req = request("/users/update");
        req.extensions_mut().insert(Principal(String::new()));
        assert_eq!(PrincipalRouteKey.identity(&req), None);
    }

    #[test]
    fn test_scope_deserializes() {
        let scope: Scope = serde_yaml::from_str("user_route").unwrap();
        assert_eq!(scope, Scope::UserRoute);
    }
}
