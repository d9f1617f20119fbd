use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Resolve the caller's IP: first hop of `x-forwarded-for` when it parses,
/// otherwise the socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded_ip.or_else(|| peer.map(|addr| addr.ip()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("203.0.113.7".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_peer_on_garbage_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        let peer: SocketAddr = "192.0.2.10:443".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(peer)),
            Some("192.0.2.10".parse().unwrap())
        );
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
