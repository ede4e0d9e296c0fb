//! Integration tests for the HTTP caching proxy (spec §4.8/§4.9,
//! components C8/C9), driven end to end: a real `axum::serve` hosting
//! the router `httpcache::proxy::router` builds, hit with a real
//! `reqwest` client, against an `httptest`-free fake origin (also a
//! real axum server) so the whole miss-then-cache-then-hit path runs
//! without mocking `HttpCacheProxy`'s private `handle_get`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use mgmtd::httpcache::cache::CacheService;
use mgmtd::httpcache::path::AbsoluteDir;
use mgmtd::httpcache::proxy::{router, HttpCacheProxy};
use tokio::net::TcpListener;

/// Spins up a tiny origin server on loopback that serves a fixed body
/// under `/pub/x/y.tgz` and counts how many times it was hit, so tests
/// can assert the cache actually saved a round trip.
async fn spawn_origin(body: &'static str) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));

    async fn handler(State((body, hits)): State<(&'static str, Arc<AtomicUsize>)>) -> &'static str {
        hits.fetch_add(1, Ordering::SeqCst);
        body
    }

    let app: Router = Router::new()
        .route("/pub/x/y.tgz", get(handler))
        .with_state((body, hits.clone()));

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/pub/"), hits)
}

async fn spawn_proxy(proxy: HttpCacheProxy) -> String {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(proxy));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn a_miss_fetches_origin_and_a_second_request_hits_the_cache() {
    let (origin_base, origin_hits) = spawn_origin("hello from origin").await;

    let cache_dir = tempfile::tempdir().unwrap();
    let cache_dir = AbsoluteDir::parse(&format!("{}/", cache_dir.path().to_str().unwrap())).unwrap();

    let proxy = HttpCacheProxy::new(
        "mirror".to_string(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        origin_base,
        Some(cache_dir),
        Arc::new(CacheService::new()),
    );
    let proxy_base = spawn_proxy(proxy).await;

    let client = reqwest::Client::new();

    let first = client.get(format!("{proxy_base}/mirror/x/y.tgz")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.text().await.unwrap(), "hello from origin");
    assert_eq!(origin_hits.load(Ordering::SeqCst), 1);

    let second = client.get(format!("{proxy_base}/mirror/x/y.tgz")).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.text().await.unwrap(), "hello from origin");
    // served from the on-disk cache, not a second origin round trip
    assert_eq!(origin_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_path_outside_the_mount_point_is_not_found() {
    let (origin_base, _hits) = spawn_origin("unused").await;

    let proxy = HttpCacheProxy::new(
        "mirror".to_string(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        origin_base,
        None,
        Arc::new(CacheService::new()),
    );
    let proxy_base = spawn_proxy(proxy).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{proxy_base}/mirror/../etc/passwd"))
        .send()
        .await
        .unwrap();

    // either the HTTP client itself normalizes the `..` before sending
    // (in which case the server sees a request outside `/mirror/` and
    // axum reports 404 for the unmatched route), or the proxy's own
    // path algebra rejects the escape; both surface as 404 here.
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn no_origin_and_no_cache_hit_is_bad_gateway() {
    let proxy = HttpCacheProxy::new(
        "mirror".to_string(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        String::new(), // no upstream configured
        None,
        Arc::new(CacheService::new()),
    );
    let proxy_base = spawn_proxy(proxy).await;

    let client = reqwest::Client::new();
    let resp = client.get(format!("{proxy_base}/mirror/x/y.tgz")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn if_modified_since_short_circuits_to_304_on_a_cache_hit() {
    let (origin_base, origin_hits) = spawn_origin("cached body").await;

    let cache_dir = tempfile::tempdir().unwrap();
    let cache_dir = AbsoluteDir::parse(&format!("{}/", cache_dir.path().to_str().unwrap())).unwrap();

    let proxy = HttpCacheProxy::new(
        "mirror".to_string(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        AbsoluteDir::parse("/mirror/").unwrap(),
        origin_base,
        Some(cache_dir),
        Arc::new(CacheService::new()),
    );
    let proxy_base = spawn_proxy(proxy).await;

    let client = reqwest::Client::new();
    let first = client.get(format!("{proxy_base}/mirror/x/y.tgz")).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let last_modified = first
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .expect("last-modified set")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(origin_hits.load(Ordering::SeqCst), 1);

    let second = client
        .get(format!("{proxy_base}/mirror/x/y.tgz"))
        .header(reqwest::header::IF_MODIFIED_SINCE, last_modified)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(origin_hits.load(Ordering::SeqCst), 1); // still served from cache
}
