//! HTTP transport for outbox delivery
//!
//! [`Transport`] is the network seam of the sync engine: it issues one request
//! and reports either a response (any status) or a [`Error::TransportFailure`]
//! when no response was obtained. Retries live in the engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::{Error, Result};

/// A fully built sync request
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub method: Method,
    pub url: Url,
    /// Extra headers (anti-forgery token, idempotency key)
    pub headers: Vec<(String, String)>,
    /// JSON body; `None` for GET and HEAD
    pub body: Option<Value>,
}

impl SyncRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response received from the collector
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    pub status: u16,
    /// Parsed JSON body; `None` when empty or not JSON
    pub body: Option<Value>,
}

impl SyncResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends sync requests to the collector
pub trait Transport: Send + Sync {
    /// Issue one request without retrying
    fn send(&self, request: &SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, request: &SyncRequest) -> impl Future<Output = Result<SyncResponse>> + Send {
        (**self).send(request)
    }
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let mut builder = self
            .http_client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("invalid header value: {}", e)))?;
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::TransportFailure(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(e) => {
                tracing::debug!(status, error = %e, "Failed to read response body");
                None
            }
        };

        Ok(SyncResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        let ok = SyncResponse {
            status: 204,
            body: None,
        };
        let rejected = SyncResponse {
            status: 500,
            body: None,
        };
        let redirect = SyncResponse {
            status: 302,
            body: None,
        };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
        assert!(!redirect.is_success());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = SyncRequest {
            method: Method::POST,
            url: Url::parse("http://localhost/api/").unwrap(),
            headers: vec![("X-CSRFToken".to_string(), "abc".to_string())],
            body: None,
        };
        assert_eq!(request.header("x-csrftoken"), Some("abc"));
        assert!(request.header("Idempotency-Key").is_none());
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(Duration::from_secs(5)).is_ok());
    }
}
