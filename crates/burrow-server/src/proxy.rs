//! Reverse-proxy pipeline for public tunnel traffic
//!
//! Catch-all handler for `/{tunnel_id}/{rest}`: resolves the tunnel,
//! serializes the request into a frame, sends it over the attached session,
//! and writes the correlated response back to the caller.

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::RESERVED_PREFIXES;
use crate::error::ApiError;
use crate::AppState;
use burrow_control::{ProxiedRequest, SessionError};
use burrow_proto::is_hop_by_hop;

/// `ANY /{tunnel_id}/{rest...}`: the first path segment is the tunnel id,
/// the remainder is forwarded verbatim
pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let (tunnel_id, rest) = match path.split_once('/') {
        Some((tunnel_id, rest)) => (tunnel_id.to_string(), rest.to_string()),
        None => (path, String::new()),
    };
    handle(state, tunnel_id, rest, request).await
}

async fn handle(
    state: Arc<AppState>,
    tunnel_id: String,
    rest: String,
    request: Request,
) -> Result<Response, ApiError> {
    // reserved routes can never shadow a tunnel
    if RESERVED_PREFIXES.contains(&tunnel_id.as_str()) {
        return Err(ApiError::TunnelNotFound);
    }

    let entry = state
        .registry
        .lookup(&tunnel_id)
        .await
        .ok_or(ApiError::TunnelNotFound)?;

    let session = entry.session().ok_or(ApiError::TunnelNotConnected)?;

    let method = request.method().to_string();
    let path = format!("/{rest}");
    let query = request.uri().query().unwrap_or("").to_string();
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());

    let headers = forwarded_request_headers(request.headers(), client_ip.as_deref());

    // bail before reading an oversized body when its length is declared
    if let Some(length) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > state.config.max_body_bytes {
            return Err(ApiError::PayloadTooLarge);
        }
    }

    let body = axum::body::to_bytes(request.into_body(), state.config.max_body_bytes)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    debug!(
        tunnel_id = %tunnel_id,
        method = %method,
        path = %path,
        body_bytes = body.len(),
        "proxying request"
    );

    let response = session
        .send_request(
            ProxiedRequest {
                method,
                path,
                query,
                headers,
                body: body.to_vec(),
            },
            state.config.request_timeout,
        )
        .await
        .map_err(|e| match e {
            SessionError::Timeout => {
                warn!(tunnel_id = %tunnel_id, "request timed out");
                ApiError::RequestTimeout
            }
            SessionError::Closed => ApiError::UpstreamGone,
            SessionError::Busy => ApiError::TunnelBusy,
        })?;

    let status =
        StatusCode::from_u16(response.status).map_err(|_| ApiError::Internal)?;

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
    }

    builder
        .body(Body::from(response.body))
        .map_err(|_| ApiError::Internal)
}

/// Build the header list forwarded to the agent: hop-by-hop headers and the
/// host are dropped (the agent sets its own host for the local origin), the
/// original host moves to `x-forwarded-host`, and the direct client address
/// is appended to `x-forwarded-for`.
fn forwarded_request_headers(
    headers: &axum::http::HeaderMap,
    client_ip: Option<&str>,
) -> Vec<(String, String)> {
    let mut forwarded = Vec::with_capacity(headers.len() + 2);
    let mut original_host = None;
    let mut forwarded_for: Vec<String> = Vec::new();

    // HeaderMap::iter repeats the name for duplicate values, preserving order
    for (name, value) in headers.iter() {
        let name = name.as_str();
        let Ok(value) = value.to_str() else { continue };

        if name.eq_ignore_ascii_case("host") {
            original_host = Some(value.to_string());
            continue;
        }
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for.push(value.to_string());
            continue;
        }
        if is_hop_by_hop(name) {
            continue;
        }
        forwarded.push((name.to_string(), value.to_string()));
    }

    if let Some(host) = original_host {
        forwarded.push(("x-forwarded-host".to_string(), host));
    }

    if let Some(ip) = client_ip {
        forwarded_for.push(ip.to_string());
    }
    if !forwarded_for.is_empty() {
        forwarded.push(("x-forwarded-for".to_string(), forwarded_for.join(", ")));
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let headers = header_map(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "h2c"),
            ("te", "trailers"),
            ("trailers", "x-checksum"),
            ("proxy-authenticate", "Basic"),
            ("proxy-authorization", "Basic xyz"),
            ("accept", "text/html"),
        ]);

        let forwarded = forwarded_request_headers(&headers, None);
        assert_eq!(forwarded, vec![("accept".to_string(), "text/html".to_string())]);
    }

    #[test]
    fn test_host_moves_to_x_forwarded_host() {
        let headers = header_map(&[("host", "tunnel.example.com"), ("accept", "*/*")]);

        let forwarded = forwarded_request_headers(&headers, None);
        assert!(forwarded
            .iter()
            .all(|(name, _)| !name.eq_ignore_ascii_case("host")));
        assert!(forwarded
            .contains(&("x-forwarded-host".to_string(), "tunnel.example.com".to_string())));
    }

    #[test]
    fn test_x_forwarded_for_appends_client() {
        let headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);

        let forwarded = forwarded_request_headers(&headers, Some("203.0.113.9"));
        assert!(forwarded
            .contains(&("x-forwarded-for".to_string(), "10.0.0.1, 203.0.113.9".to_string())));
    }

    #[test]
    fn test_duplicate_headers_survive() {
        let headers = header_map(&[("cookie", "a=1"), ("cookie", "b=2")]);

        let forwarded = forwarded_request_headers(&headers, None);
        let cookies: Vec<_> = forwarded
            .iter()
            .filter(|(name, _)| name == "cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }
}
