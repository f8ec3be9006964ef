//! Local dispatch: executes a request frame against the local origin

use burrow_proto::{is_hop_by_hop, Frame};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::{debug, warn};

/// The local HTTP service a tunnel forwards to
#[derive(Debug, Clone)]
pub struct LocalOrigin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl LocalOrigin {
    /// URL for a proxied path and query against this origin
    pub fn url_for(&self, path: &str, query: &str) -> String {
        let mut url = format!("{}://{}:{}{}", self.scheme, self.host, self.port, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

impl std::fmt::Display for LocalOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Execute one proxied request against the local origin.
///
/// Always produces a response frame for the given correlation id; local
/// failures become synthetic responses (502 for an unreachable origin, 504
/// for a local timeout) with a structured JSON body, so the server can
/// relay them without special handling.
pub async fn dispatch(
    client: &reqwest::Client,
    origin: &LocalOrigin,
    local_timeout: Duration,
    id: u64,
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> Frame {
    let url = origin.url_for(&path, &query);

    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return synthetic_response(id, 400, &format!("unsupported method: {method}"));
        }
    };

    debug!(%method, %url, body_bytes = body.len(), "dispatching to local origin");

    let mut header_map = HeaderMap::new();
    for (name, value) in &headers {
        // the client sets its own host and content-length
        if is_hop_by_hop(name)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        header_map.append(name, value);
    }

    let result = client
        .request(method, &url)
        .headers(header_map)
        .body(body)
        .timeout(local_timeout)
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            warn!(%url, "local origin timed out");
            return synthetic_response(id, 504, "local origin timed out");
        }
        Err(e) if e.is_connect() => {
            warn!(%url, error = %e, "local origin unreachable");
            return synthetic_response(id, 502, &format!("local origin unreachable: {origin}"));
        }
        Err(e) => {
            warn!(%url, error = %e, "local request failed");
            return synthetic_response(id, 502, "local request failed");
        }
    };

    let status = response.status().as_u16();
    let response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name.as_str()) && !name.as_str().eq_ignore_ascii_case("content-length")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    match response.bytes().await {
        Ok(bytes) => Frame::Response {
            id,
            status,
            headers: response_headers,
            body: bytes.to_vec(),
        },
        Err(e) => {
            warn!(%url, error = %e, "failed reading local response body");
            synthetic_response(id, 502, "failed reading local response body")
        }
    }
}

/// Error response the agent fabricates when the local call fails
fn synthetic_response(id: u64, status: u16, message: &str) -> Frame {
    let kind = match status {
        504 => "REQUEST_TIMEOUT",
        400 => "INVALID_REQUEST",
        _ => "UPSTREAM_GONE",
    };
    let body = serde_json::json!({ "error": kind, "message": message });
    Frame::Response {
        id,
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: body.to_string().into_bytes(),
    }
}
