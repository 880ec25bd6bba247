//! Network access for the cache controller

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;

use super::request::{Request, Response};
use crate::error::{Error, Result};

/// Fetches a request from the network.
///
/// Any HTTP status is a successful fetch; `Err` means no response at all.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<F: Fetcher> Fetcher for Arc<F> {
    fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
        (**self).fetch(request)
    }
}

/// reqwest-backed fetcher. It keeps no cookie store and adds no
/// authentication, so every request goes out without credentials.
#[derive(Clone)]
pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Config(format!("invalid method {}: {}", request.method, e)))?;

        let response = self
            .http_client
            .request(method, request.url.clone())
            .send()
            .await
            .map_err(|e| Error::TransportFailure(format!("fetch {} failed: {}", request.url, e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::TransportFailure(format!("reading {} failed: {}", request.url, e)))?;

        Ok(Response {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}
