//! Cache controller scenarios against an in-process network
//!
//! The network can be switched between online, offline (immediate failure)
//! and stalled (never answers) to exercise every fallback path.

use collecte_core::cache::{
    CacheController, CacheSettings, CacheStore, Destination, Fetcher, Lifecycle, Request,
    Response, ResponseSource,
};
use collecte_core::{ClientNotification, Error, Result};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Online,
    Offline,
    Stalled,
}

struct FakeNetwork {
    pages: Mutex<HashMap<String, Response>>,
    link: Mutex<Link>,
    calls: AtomicUsize,
}

impl FakeNetwork {
    fn new() -> Arc<Self> {
        let pages = HashMap::from([
            ("/".to_string(), html("shell")),
            ("/index.html".to_string(), html("index")),
            ("/static/offline.html".to_string(), html("offline page")),
            ("/static/icons/icon-192.png".to_string(), png()),
            ("/static/icons/icon-512.png".to_string(), png()),
        ]);
        Arc::new(Self {
            pages: Mutex::new(pages),
            link: Mutex::new(Link::Online),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_link(&self, link: Link) {
        *self.link.lock().unwrap() = link;
    }

    fn serve(&self, path: &str, response: Response) {
        self.pages.lock().unwrap().insert(path.to_string(), response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let link = *self.link.lock().unwrap();
        match link {
            Link::Offline => Err(Error::TransportFailure("network unreachable".into())),
            Link::Stalled => {
                std::future::pending::<()>().await;
                Err(Error::TransportFailure("unreachable".into()))
            }
            Link::Online => {
                let page = self.pages.lock().unwrap().get(request.url.path()).cloned();
                Ok(page.unwrap_or_else(|| Response::new(404, Vec::new(), "not found")))
            }
        }
    }
}

fn html(body: &str) -> Response {
    Response::new(200, vec![("Content-Type".into(), "text/html".into())], body)
}

fn png() -> Response {
    Response::new(200, vec![("Content-Type".into(), "image/png".into())], vec![0x89, b'P'])
}

fn json_body(body: &str) -> Response {
    Response::new(
        200,
        vec![("Content-Type".into(), "application/json".into())],
        body,
    )
}

fn settings(max_runtime_entries: usize) -> CacheSettings {
    CacheSettings {
        origin: Url::parse("http://collecte.local").unwrap(),
        shell_generation: "collecte-shell-v3".into(),
        runtime_generation: "collecte-runtime-v1".into(),
        max_runtime_entries,
        navigation_timeout: Duration::from_millis(100),
        api_prefix: "/api/".into(),
        offline_page: "/static/offline.html".into(),
        precache: vec![
            "/".into(),
            "/index.html".into(),
            "/static/offline.html".into(),
            "/static/icons/icon-192.png".into(),
            "/static/icons/icon-512.png".into(),
        ],
        skip_waiting: true,
    }
}

fn url(path: &str) -> Url {
    Url::parse("http://collecte.local").unwrap().join(path).unwrap()
}

async fn active_controller(
    network: &Arc<FakeNetwork>,
    max_runtime_entries: usize,
) -> CacheController<Arc<FakeNetwork>> {
    collecte_core::logging::init_test();
    let controller = CacheController::new(
        CacheStore::open_in_memory().unwrap(),
        Arc::clone(network),
        settings(max_runtime_entries),
    )
    .unwrap();
    let report = controller.install().await.unwrap();
    assert_eq!(report.cached.len(), 5);
    assert!(report.activated);
    controller
}

// ============================================
// Lifecycle
// ============================================

#[tokio::test]
async fn test_activation_collects_superseded_generations() {
    let network = FakeNetwork::new();
    let store = CacheStore::open_in_memory().unwrap();
    store
        .put("collecte-shell-v2", "http://collecte.local/", &html("stale shell"))
        .unwrap();
    store.open_generation("collecte-runtime-v1").unwrap();
    store.open_generation("third-party").unwrap();

    let controller = CacheController::new(store, Arc::clone(&network), settings(10)).unwrap();
    let mut client = controller.subscribe();
    controller.install().await.unwrap();

    assert_eq!(controller.lifecycle(), Lifecycle::Active);
    let mut generations = controller.store().generations().unwrap();
    generations.sort();
    assert_eq!(generations, vec!["collecte-runtime-v1", "collecte-shell-v3"]);
    assert_eq!(
        client.recv().await,
        Some(ClientNotification::ControllerChanged)
    );

    // The stale shell is gone, so the root now comes from the new shell
    network.set_link(Link::Offline);
    let served = controller.handle(&Request::navigate(url("/"))).await.unwrap();
    assert_eq!(served.response.body, b"shell");
}

#[tokio::test]
async fn test_install_survives_failed_precache_entries() {
    let network = FakeNetwork::new();
    network.serve("/index.html", Response::new(500, Vec::new(), "boom"));
    let controller = CacheController::new(
        CacheStore::open_in_memory().unwrap(),
        Arc::clone(&network),
        settings(10),
    )
    .unwrap();

    let report = controller.install().await.unwrap();

    assert_eq!(report.skipped, vec!["/index.html"]);
    assert_eq!(report.cached.len(), 4);
    assert_eq!(controller.store().count("collecte-shell-v3").unwrap(), 4);
}

// ============================================
// Navigation
// ============================================

#[tokio::test]
async fn test_stalled_navigation_resolves_to_shell_within_timeout() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.set_link(Link::Stalled);

    let started = Instant::now();
    let served = tokio::time::timeout(
        Duration::from_secs(2),
        controller.handle(&Request::navigate(url("/"))),
    )
    .await
    .expect("navigation must not hang")
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body, b"shell");
}

#[tokio::test]
async fn test_offline_navigation_fallback_chain() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.set_link(Link::Offline);

    let served = controller
        .handle(&Request::navigate(url("/formulaire/nouveau")))
        .await
        .unwrap();
    assert_eq!(served.response.body, b"shell");

    let shell = "collecte-shell-v3";
    controller.store().delete_generation(shell).unwrap();
    controller
        .store()
        .put(shell, "http://collecte.local/static/offline.html", &html("offline page"))
        .unwrap();
    let served = controller
        .handle(&Request::navigate(url("/formulaire/nouveau")))
        .await
        .unwrap();
    assert_eq!(served.response.body, b"offline page");

    controller.store().delete_generation(shell).unwrap();
    let served = controller
        .handle(&Request::navigate(url("/formulaire/nouveau")))
        .await
        .unwrap();
    assert_eq!(served.source, ResponseSource::Synthetic);
    assert_eq!(served.response.status, 503);
}

#[tokio::test]
async fn test_online_navigation_is_not_cached() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.serve("/liste", html("liste"));

    let served = controller.handle(&Request::navigate(url("/liste"))).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(controller.store().count("collecte-runtime-v1").unwrap(), 0);
}

// ============================================
// API and assets
// ============================================

#[tokio::test]
async fn test_api_is_network_first_with_cache_fallback() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.serve("/api/personnes/", json_body(r#"[{"id":1}]"#));
    network.serve("/api/erreur/", Response::new(500, Vec::new(), "oops"));

    let request = Request::get(url("/api/personnes/"));
    let online = controller.handle(&request).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    // Non-2xx answers are returned but never stored
    let failed = controller.handle(&Request::get(url("/api/erreur/"))).await.unwrap();
    assert_eq!(failed.response.status, 500);
    assert_eq!(controller.store().count("collecte-runtime-v1").unwrap(), 1);

    network.set_link(Link::Offline);
    let offline = controller.handle(&request).await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.body, br#"[{"id":1}]"#);

    let missing = controller.handle(&Request::get(url("/api/erreur/"))).await.unwrap();
    assert_eq!(missing.source, ResponseSource::Synthetic);
    assert_eq!(missing.response.body, br#"{"error":"offline"}"#);
}

#[tokio::test]
async fn test_assets_are_cache_first() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.serve("/static/app.css", html("body{}"));

    let request = Request::asset(url("/static/app.css"), Destination::Style);
    let first = controller.handle(&request).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let calls = network.calls();
    let second = controller.handle(&request).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(network.calls(), calls);
}

#[tokio::test]
async fn test_other_requests_fall_back_without_write_back() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 10).await;
    network.serve("/manifest.json", json_body("{}"));

    let served = controller
        .handle(&Request::get(url("/manifest.json")))
        .await
        .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(controller.store().count("collecte-runtime-v1").unwrap(), 0);

    network.set_link(Link::Offline);
    let precached = controller
        .handle(&Request::get(url("/index.html")))
        .await
        .unwrap();
    assert_eq!(precached.source, ResponseSource::Cache);

    let missing = controller
        .handle(&Request::get(url("/manifest.json")))
        .await
        .unwrap();
    assert_eq!(missing.response.status, 503);
}

// ============================================
// Bounded runtime cache
// ============================================

#[tokio::test]
async fn test_runtime_bound_holds_after_every_write() {
    let network = FakeNetwork::new();
    let max = 5;
    let controller = active_controller(&network, max).await;

    for i in 0..20 {
        let (path, request) = if i % 2 == 0 {
            let path = format!("/api/personnes/{}/", i);
            (path.clone(), Request::get(url(&path)))
        } else {
            let path = format!("/static/img/{}.png", i);
            (path.clone(), Request::asset(url(&path), Destination::Image))
        };
        network.serve(&path, json_body("{}"));

        controller.handle(&request).await.unwrap();
        assert!(controller.store().count("collecte-runtime-v1").unwrap() <= max);
    }

    // FIFO: the five most recent writes remain
    let keys = controller.store().keys("collecte-runtime-v1").unwrap();
    assert_eq!(
        keys,
        vec![
            "http://collecte.local/static/img/15.png",
            "http://collecte.local/api/personnes/16/",
            "http://collecte.local/static/img/17.png",
            "http://collecte.local/api/personnes/18/",
            "http://collecte.local/static/img/19.png",
        ]
    );
}

#[tokio::test]
async fn test_refetched_entry_moves_to_the_end() {
    let network = FakeNetwork::new();
    let controller = active_controller(&network, 2).await;
    for path in ["/api/a/", "/api/b/"] {
        network.serve(path, json_body("{}"));
        controller.handle(&Request::get(url(path))).await.unwrap();
    }

    // Refreshing a keeps it; c then evicts b
    controller.handle(&Request::get(url("/api/a/"))).await.unwrap();
    network.serve("/api/c/", json_body("{}"));
    controller.handle(&Request::get(url("/api/c/"))).await.unwrap();

    assert_eq!(
        controller.store().keys("collecte-runtime-v1").unwrap(),
        vec!["http://collecte.local/api/a/", "http://collecte.local/api/c/"]
    );
}
