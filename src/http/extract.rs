//! Identity extraction from inbound HTTP requests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// Proxy-supplied client address list; the first entry is the client.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Single proxy-supplied client address.
pub const REAL_IP: &str = "x-real-ip";
/// Dedicated API token header.
pub const API_KEY: &str = "api_key";

/// Address used when no header or peer address yields a valid one.
pub const DEFAULT_CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Resolve the client address of a request.
///
/// Order: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// transport peer, then [`DEFAULT_CLIENT_IP`]. Unparseable values are skipped.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> IpAddr {
    let forwarded = header_str(headers, FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .and_then(parse_ip);
    if let Some(ip) = forwarded {
        return ip;
    }

    if let Some(ip) = header_str(headers, REAL_IP).and_then(parse_ip) {
        return ip;
    }

    peer.map(|addr| addr.ip()).unwrap_or(DEFAULT_CLIENT_IP)
}

/// Extract the access token of a request, if any.
///
/// The `API_KEY` header wins over an `Authorization: Bearer` value. Blank
/// values count as absent.
pub fn api_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = header_str(headers, API_KEY)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    header_str(headers, AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    value.trim().parse().ok()
}
