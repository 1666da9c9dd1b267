//! Client address for logging and consumer ids.
use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Header priority: CF-Connecting-IP, X-Real-IP, first hop of
/// X-Forwarded-For, then the transport address (without port).
pub fn real_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    for name in ["cf-connecting-ip", "x-real-ip"] {
        if let Some(ip) = header_value(headers, name) {
            return ip.to_string();
        }
    }
    if let Some(first) = header_value(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
