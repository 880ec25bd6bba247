//! Intercepted requests, response snapshots and request classification

use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Header marking the generated image placeholder
pub const PLACEHOLDER_HEADER: &str = "X-Collecte-Placeholder";

const PLACEHOLDER_SVG: &str = concat!(
    r#"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64" viewBox="0 0 64 64">"#,
    r##"<rect width="64" height="64" fill="#e0e0e0"/>"##,
    r##"<path d="M16 44l10-12 8 9 6-7 8 10z" fill="#9e9e9e"/>"##,
    "</svg>"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Full-page navigation
    Navigate,
    #[default]
    SameOrigin,
    Cors,
    NoCors,
}

/// What the response will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Style,
    Script,
    Image,
    Font,
    #[default]
    Other,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Document => "document",
            Destination::Style => "style",
            Destination::Script => "script",
            Destination::Image => "image",
            Destination::Font => "font",
            Destination::Other => "other",
        }
    }

    fn is_static_asset(&self) -> bool {
        matches!(
            self,
            Destination::Style | Destination::Script | Destination::Image | Destination::Font
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" => Ok(Destination::Document),
            "style" => Ok(Destination::Style),
            "script" => Ok(Destination::Script),
            "image" => Ok(Destination::Image),
            "font" => Ok(Destination::Font),
            "other" | "" => Ok(Destination::Other),
            other => Err(Error::Config(format!("unknown destination: {}", other))),
        }
    }
}

/// A network-bound request seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub mode: Mode,
    pub destination: Destination,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            mode: Mode::default(),
            destination: Destination::default(),
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: Mode::Navigate,
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    pub fn asset(url: Url, destination: Destination) -> Self {
        Self {
            destination,
            ..Self::get(url)
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_uppercase();
        self
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Cache key: the absolute url without its fragment
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

pub(crate) fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Response snapshot, as fetched or as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_placeholder(&self) -> bool {
        self.header(PLACEHOLDER_HEADER).is_some()
    }

    /// 503 JSON answered to API calls with no network and no cached copy
    pub fn offline_api() -> Self {
        Self::new(
            503,
            vec![("Content-Type".into(), "application/json".into())],
            r#"{"error":"offline"}"#,
        )
    }

    /// Last resort for navigations
    pub fn offline_navigation() -> Self {
        Self::new(
            503,
            vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            "Offline",
        )
    }

    pub fn image_placeholder() -> Self {
        Self::new(
            200,
            vec![
                ("Content-Type".into(), "image/svg+xml".into()),
                (PLACEHOLDER_HEADER.into(), "1".into()),
            ],
            PLACEHOLDER_SVG,
        )
    }

    pub fn offline_empty() -> Self {
        Self::new(503, Vec::new(), Vec::new())
    }
}

/// Fetch policy bucket; the first matching rule wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Non-GET, forwarded untouched
    PassThrough,
    /// Network-first, cached into RUNTIME
    Api,
    /// Network-first under a timeout, shell fallback chain
    Navigation,
    /// Cache-first, cached into RUNTIME
    StaticAsset,
    /// Network-first, cache fallback, no write-back
    Other,
}

pub fn classify(request: &Request, api_prefix: &str) -> RequestClass {
    if !request.is_get() {
        RequestClass::PassThrough
    } else if is_api_path(request.url.path(), api_prefix) {
        RequestClass::Api
    } else if request.mode == Mode::Navigate {
        RequestClass::Navigation
    } else if request.destination.is_static_asset() {
        RequestClass::StaticAsset
    } else {
        RequestClass::Other
    }
}

/// Prefixed or nested (`/fr/api/...`) API paths
fn is_api_path(path: &str, api_prefix: &str) -> bool {
    path.starts_with(api_prefix) || path.contains(api_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse("http://collecte.local").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_classification_order() {
        let prefix = "/api/";

        let post = Request::get(url("/api/personnes/")).with_method("post");
        assert_eq!(classify(&post, prefix), RequestClass::PassThrough);

        let api_nav = Request::navigate(url("/api/personnes/"));
        assert_eq!(classify(&api_nav, prefix), RequestClass::Api);

        let nested = Request::get(url("/fr/api/stats/"));
        assert_eq!(classify(&nested, prefix), RequestClass::Api);

        assert_eq!(
            classify(&Request::navigate(url("/formulaire")), prefix),
            RequestClass::Navigation
        );
        assert_eq!(
            classify(&Request::asset(url("/static/app.css"), Destination::Style), prefix),
            RequestClass::StaticAsset
        );
        assert_eq!(
            classify(&Request::get(url("/manifest.json")), prefix),
            RequestClass::Other
        );
    }

    #[test]
    fn test_cache_key_drops_fragment() {
        let request = Request::get(url("/index.html#top"));
        assert_eq!(request.cache_key(), "http://collecte.local/index.html");
    }

    #[test]
    fn test_synthetic_responses() {
        let api = Response::offline_api();
        assert_eq!(api.status, 503);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&api.body).unwrap(),
            serde_json::json!({"error": "offline"})
        );

        let placeholder = Response::image_placeholder();
        assert!(placeholder.is_success());
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.header("content-type"), Some("image/svg+xml"));

        assert_eq!(Response::offline_navigation().body, b"Offline");
        assert!(Response::offline_empty().body.is_empty());
    }

    #[test]
    fn test_destination_parse() {
        assert_eq!("Image".parse::<Destination>().unwrap(), Destination::Image);
        assert_eq!("".parse::<Destination>().unwrap(), Destination::Other);
        assert!("video".parse::<Destination>().is_err());
    }
}
