//! HTTP caching proxy resource (spec §4.8, component C8).

use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::httpcache::cache::CacheService;
use crate::httpcache::httpdate;
use crate::httpcache::path::{AbsoluteDir, AbsoluteFile, PathError, RelativeFile};
use crate::resource::{Resource, ResourceId, Services, ShutdownCtx};

/// Declared attributes (spec §3 "HTTP proxy resource").
pub struct HttpCacheProxy {
    pub name: String,
    pub public_path: AbsoluteDir,
    pub sub: AbsoluteDir,
    /// Origin base to prepend; empty means "no upstream" (spec §4.8
    /// step 3: "can't proxy" when there's also no cache hit).
    pub head: String,
    pub cache_dir: Option<AbsoluteDir>,
    cache: Arc<CacheService>,
    client: reqwest::Client,
}

impl HttpCacheProxy {
    pub fn new(
        name: String,
        public_path: AbsoluteDir,
        sub: AbsoluteDir,
        head: String,
        cache_dir: Option<AbsoluteDir>,
        cache: Arc<CacheService>,
    ) -> Self {
        Self {
            name,
            public_path,
            sub,
            head,
            cache_dir,
            cache,
            client: reqwest::Client::new(),
        }
    }

    /// Translates a request path into the relative file it names
    /// under both the origin and the cache (spec §4.8 step 1).
    /// `Err` means the request doesn't belong under this proxy's
    /// mount point at all.
    fn translate(&self, request_path: &str) -> std::result::Result<RelativeFile, PathError> {
        let tail = self.sub.strip_prefix(request_path)?;
        let rel = self.sub.strip_prefix(self.public_path.as_str())?;

        let tail_segs: Vec<&str> = tail.as_str().split('/').filter(|s| !s.is_empty()).collect();
        let rel_segs: Vec<&str> = rel.as_str().split('/').filter(|s| !s.is_empty()).collect();

        if tail_segs.len() < rel_segs.len() || tail_segs[..rel_segs.len()] != rel_segs[..] {
            return Err(PathError::Escapes);
        }

        RelativeFile::parse(&tail_segs[rel_segs.len()..].join("/"))
    }

    fn cache_path(&self, rel: &RelativeFile) -> Option<std::result::Result<AbsoluteFile, PathError>> {
        self.cache_dir.as_ref().map(|dir| dir.join(rel))
    }

    async fn handle_get(&self, request_path: &str, headers: &HeaderMap) -> Response {
        let rel = match self.translate(request_path) {
            Ok(rel) => rel,
            Err(_) => return not_found("no such path"),
        };

        let if_modified_since = headers
            .get(axum::http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(httpdate::parse);
        let range = headers
            .get(axum::http::header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        if let Some(cache_path) = self.cache_path(&rel) {
            let cache_path = match cache_path {
                Ok(p) => p,
                Err(_) => return not_found("cache path escapes cache directory"),
            };
            match self.cache.read(&cache_path).await {
                Ok(Some(hit)) => return serve_content(&hit.body, hit.modified, if_modified_since, range),
                Ok(None) => {}
                Err(e) => return not_found(&format!("cache read failed: {e}")),
            }
        }

        if self.head.is_empty() {
            return (StatusCode::BAD_GATEWAY, "can't proxy").into_response();
        }

        let origin_url = format!("{}{}", self.head, rel.as_str());
        let upstream = match self.client.get(&origin_url).send().await {
            Ok(resp) => resp,
            Err(e) => return not_found(&format!("upstream request failed: {e}")),
        };
        if !upstream.status().is_success() {
            return not_found(&format!("upstream returned {}", upstream.status()));
        }

        let modified = upstream
            .headers()
            .get(axum::http::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(httpdate::parse)
            .unwrap_or_else(SystemTime::now);

        let body = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => return not_found(&format!("upstream body read failed: {e}")),
        };

        if let (Some(dir), Some(Ok(cache_path))) = (&self.cache_dir, self.cache_path(&rel)) {
            if let Err(e) = self.cache.write(dir, &cache_path, &body, modified).await {
                log::warn!("{}: cache write failed: {e}", self.name);
            }
        }

        serve_content(&body, modified, if_modified_since, range)
    }
}

fn not_found(reason: &str) -> Response {
    (StatusCode::NOT_FOUND, reason.to_string()).into_response()
}

/// Parses a single-range `Range: bytes=start-end` header. Multi-range
/// requests are not supported; callers fall back to a full response.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
    Some((start, end))
}

/// Spec §4.8 step 6: an `http.ServeContent`-equivalent honouring
/// `If-Modified-Since` and a single byte range.
fn serve_content(
    body: &[u8],
    modified: SystemTime,
    if_modified_since: Option<SystemTime>,
    range: Option<(u64, Option<u64>)>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(axum::http::header::LAST_MODIFIED, httpdate::format(modified).parse().unwrap());

    if let Some(ims) = if_modified_since {
        if modified <= ims {
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }
    }

    if let Some((start, end)) = range {
        let len = body.len() as u64;
        let end = end.unwrap_or(len.saturating_sub(1)).min(len.saturating_sub(1));
        if start >= len || start > end {
            headers.insert(
                axum::http::header::CONTENT_RANGE,
                format!("bytes */{len}").parse().unwrap(),
            );
            return (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response();
        }
        headers.insert(
            axum::http::header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{len}").parse().unwrap(),
        );
        let slice = body[start as usize..=end as usize].to_vec();
        return (StatusCode::PARTIAL_CONTENT, headers, Bytes::from(slice)).into_response();
    }

    (StatusCode::OK, headers, Bytes::from(body.to_vec())).into_response()
}

async fn axum_handler(State(proxy): State<Arc<HttpCacheProxy>>, request: Request) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    proxy.handle_get(request.uri().path(), request.headers()).await
}

#[async_trait]
impl Resource for HttpCacheProxy {
    fn id(&self) -> ResourceId {
        ResourceId {
            kind: "http_cache_proxy",
            name: self.name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.head.is_empty() && !self.head.starts_with("http://") && !self.head.starts_with("https://") {
            return Err(Error::configuration_invalid("head must be an http(s) URL prefix"));
        }
        Ok(())
    }

    async fn init(&self, _services: Services) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, mut ctx: ShutdownCtx) -> Result<()> {
        ctx.cancelled().await;
        Ok(())
    }

    async fn check_apply(&self, apply_permitted: bool) -> Result<bool> {
        let Some(dir) = &self.cache_dir else { return Ok(true) };

        match tokio::fs::metadata(dir.as_str()).await {
            Ok(meta) if meta.is_dir() => Ok(true),
            _ if !apply_permitted => Ok(false),
            _ => {
                tokio::fs::create_dir_all(dir.as_str())
                    .await
                    .map_err(|e| Error::transient(format!("mkdir {}: {e}", dir.as_str())))?;
                Ok(false)
            }
        }
    }

    fn cmp(&self, other: &dyn Resource) -> Option<String> {
        let other = other.as_any().downcast_ref::<HttpCacheProxy>()?;
        if other.public_path != self.public_path {
            return Some("public path changed".to_string());
        }
        if other.head != self.head {
            return Some("head changed".to_string());
        }
        None
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mounts this proxy onto a host axum router at its declared public
/// path (spec §6: "we assume one is present and accepts mounted
/// handlers" — the out-of-scope general-purpose HTTP server).
pub fn router(proxy: Arc<HttpCacheProxy>) -> Router {
    let mount = format!("{}{{*rest}}", proxy.public_path.as_str());
    Router::new().route(&mount, get(axum_handler)).with_state(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> HttpCacheProxy {
        HttpCacheProxy::new(
            "p".to_string(),
            AbsoluteDir::parse("/mirror/").unwrap(),
            AbsoluteDir::parse("/mirror/").unwrap(),
            "https://origin.example/pub/".to_string(),
            Some(AbsoluteDir::parse("/var/cache/p/").unwrap()),
            Arc::new(CacheService::new()),
        )
    }

    #[test]
    fn translates_the_worked_example() {
        let p = proxy();
        let rel = p.translate("/mirror/x/y.tgz").unwrap();
        assert_eq!(rel.to_string(), "x/y.tgz");
    }

    #[test]
    fn rejects_a_path_escape() {
        let p = proxy();
        assert!(p.translate("/mirror/../etc/passwd").is_err());
    }

    #[test]
    fn range_header_parses() {
        assert_eq!(parse_range("bytes=0-99"), Some((0, Some(99))));
        assert_eq!(parse_range("bytes=100-"), Some((100, None)));
        assert_eq!(parse_range("bytes=0-1,2-3"), None);
    }

    #[test]
    fn serve_content_full_body_sets_last_modified() {
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let resp = serve_content(b"hello", modified, None, None);
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn serve_content_not_modified_short_circuits() {
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let resp = serve_content(b"hello", modified, Some(modified), None);
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }
}
