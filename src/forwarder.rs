use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::jwt::Claims;
use crate::routes::{build_target_url, Route};

/// Outbound dial budget; keep-alive stays enabled on the shared client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Classified upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyError {
    pub code: StatusCode,
    pub message: &'static str,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProxyError {}

/// Proxies accepted requests to their matched backend over a single shared
/// HTTP client.
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build outbound HTTP client");
        Self { client }
    }

    /// Forward a request to the route's backend, streaming the body both
    /// ways. The whole exchange runs under the route's timeout. Identity
    /// headers are materialized from the validated claims only; whatever
    /// the client sent under those names is discarded.
    pub async fn forward(
        &self,
        route: &Route,
        req: Request,
        claims: Option<&Claims>,
    ) -> Result<Response, ProxyError> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let target = build_target_url(route, &path, query.as_deref());

        let request_id = request_id(req.headers());
        let client_ip = client_ip(&req);
        let method = req.method().clone();

        let mut headers = req.headers().clone();
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::HOST);
        headers.remove(USER_ID_HEADER);
        headers.remove(CLIENT_ID_HEADER);
        set_header(&mut headers, REQUEST_ID_HEADER, &request_id);
        set_header(&mut headers, FORWARDED_FOR_HEADER, &client_ip);
        if let Some(claims) = claims {
            set_header(&mut headers, USER_ID_HEADER, &claims.sub);
            if let Some(client_id) = &claims.client_id {
                set_header(&mut headers, CLIENT_ID_HEADER, client_id);
            }
        }

        let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

        let upstream = self
            .client
            .request(method, target)
            .headers(headers)
            .body(body)
            .timeout(route.timeout)
            .send()
            .await
            .map_err(classify_error)?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                // hyper re-frames the streamed body itself
                if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
                    continue;
                }
                response_headers.append(name.clone(), value.clone());
            }
            set_header(response_headers, REQUEST_ID_HEADER, &request_id);
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|_| ProxyError {
                code: StatusCode::BAD_GATEWAY,
                message: "failed to create request",
            })
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout -> 504, construction -> 502 "failed to create request",
/// everything else transport-level -> 502 "backend unreachable".
fn classify_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError {
            code: StatusCode::GATEWAY_TIMEOUT,
            message: "backend timeout",
        }
    } else if err.is_builder() {
        ProxyError {
            code: StatusCode::BAD_GATEWAY,
            message: "failed to create request",
        }
    } else {
        ProxyError {
            code: StatusCode::BAD_GATEWAY,
            message: "backend unreachable",
        }
    }
}

/// Client-provided X-Request-ID, or a fresh UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Caller IP: first X-Forwarded-For entry, falling back to the peer address.
pub fn client_ip(req: &Request) -> String {
    if let Some(xff) = req
        .headers()
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let first = xff.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
