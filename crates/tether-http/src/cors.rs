//! CORS headers for browser-facing transports.

use hyper::header::HeaderValue;
use hyper::{HeaderMap, Response, StatusCode};

use crate::body::{empty_body, BoxedBody};

/// CORS policy. With no configured origins and no credentials the policy is
/// the permissive `*`; with credentials the origin is always echoed back and
/// never wildcarded.
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl CorsConfig {
    fn origin_value(&self, request_origin: Option<&str>) -> Option<HeaderValue> {
        let allowed = |origin: &str| {
            self.allowed_origins.is_empty()
                || self.allowed_origins.iter().any(|o| o == origin || o == "*")
        };
        if self.allow_credentials {
            let origin = request_origin.filter(|o| allowed(o))?;
            return HeaderValue::from_str(origin).ok();
        }
        if self.allowed_origins.is_empty() {
            return Some(HeaderValue::from_static("*"));
        }
        match request_origin {
            Some(origin) if allowed(origin) => HeaderValue::from_str(origin).ok(),
            _ => None,
        }
    }

    /// Applies response headers for a simple (non-preflight) request.
    pub fn apply(&self, request_origin: Option<&str>, headers: &mut HeaderMap) {
        if let Some(origin) = self.origin_value(request_origin) {
            headers.insert("Access-Control-Allow-Origin", origin);
            if self.allow_credentials {
                headers.insert(
                    "Access-Control-Allow-Credentials",
                    HeaderValue::from_static("true"),
                );
            }
        }
    }

    /// Builds the OPTIONS preflight response.
    pub fn preflight(&self, request_origin: Option<&str>) -> Response<BoxedBody> {
        let mut response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
        let headers = response.headers_mut();
        self.apply(request_origin, headers);
        headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static(
                "Content-Type, Accept, Authorization, Mcp-Session-Id, Last-Event-ID",
            ),
        );
        headers.insert("Access-Control-Max-Age", HeaderValue::from_static("86400"));
        response
    }
}
