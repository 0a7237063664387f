//! Cached custom error pages substituted for matching upstream statuses.
//!
//! Pages are fetched once from their configured location and then served
//! verbatim whenever an upstream response carries one of the page's status
//! codes.

use crate::error::ProxyBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers preserved from a fetched error page.
const CACHED_HEADERS: [&str; 6] = [
    "content-type",
    "content-encoding",
    "cache-control",
    "last-modified",
    "retry-after",
    "set-cookie",
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One configured error page. Location and status codes are fixed at
/// construction; the cached body and headers are published together once a
/// fetch succeeds and never change afterwards.
pub struct ErrorPage {
    pub location: String,
    pub status_codes: Vec<u16>,
    cached: Mutex<Option<CachedPage>>,
}

#[derive(Clone)]
struct CachedPage {
    body: Bytes,
    headers: HeaderMap,
}

impl ErrorPage {
    fn new(location: String, status_codes: Vec<u16>) -> ErrorPage {
        ErrorPage {
            location,
            status_codes,
            cached: Mutex::new(None),
        }
    }

    pub fn body(&self) -> Option<Bytes> {
        self.cached.lock().as_ref().map(|c| c.body.clone())
    }

    fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }

    fn publish(&self, body: Bytes, headers: HeaderMap) {
        *self.cached.lock() = Some(CachedPage { body, headers });
    }
}

/// Status-indexed table of error pages with a dedicated fetch client.
pub struct ErrorPages {
    pages: Mutex<HashMap<u16, Arc<ErrorPage>>>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl ErrorPages {
    /// Build the table and start fetching every distinct page in the
    /// background.
    pub fn new(cfg: &HashMap<String, Vec<u16>>) -> Arc<ErrorPages> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        // page origins are hit rarely; no idle connections kept
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        let pages = Arc::new(ErrorPages {
            pages: Mutex::new(HashMap::new()),
            client,
        });
        pages.update(cfg);
        pages
    }

    /// Replace the whole table and refresh every page in the background.
    pub fn update(self: &Arc<Self>, cfg: &HashMap<String, Vec<u16>>) {
        let mut index = HashMap::new();
        let mut distinct = Vec::new();
        for (location, codes) in cfg {
            let page = Arc::new(ErrorPage::new(location.clone(), codes.clone()));
            for &code in codes {
                index.insert(code, Arc::clone(&page));
            }
            distinct.push(page);
        }
        *self.pages.lock() = index;

        for page in distinct {
            let pages = Arc::clone(self);
            tokio::spawn(async move {
                pages.fetch(&page).await;
            });
        }
    }

    /// Fetch and cache one page. A response status found in the page's own
    /// code set counts as OK, so an origin serving its 503 page with a 503
    /// still caches.
    async fn fetch(&self, page: &ErrorPage) {
        debug!(location = %page.location, "fetching error page");

        let uri: Uri = match page.location.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(location = %page.location, error = %e, "invalid error page location");
                return;
            }
        };

        let result = tokio::time::timeout(FETCH_TIMEOUT, async {
            let req = Request::builder()
                .uri(uri)
                .body(Empty::<Bytes>::new())
                .expect("valid GET request from parsed uri");
            let resp = self.client.request(req).await?;
            let (parts, body) = resp.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>((parts, body))
        })
        .await;

        let (parts, body) = match result {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(location = %page.location, error = %e, "could not fetch error page");
                return;
            }
            Err(_) => {
                warn!(location = %page.location, "timed out fetching error page");
                return;
            }
        };

        let mut status = parts.status;
        if page.status_codes.contains(&status.as_u16()) {
            status = StatusCode::OK;
        }
        if status != StatusCode::OK {
            warn!(location = %page.location, status = parts.status.as_u16(),
                "error page fetch returned non-200");
            return;
        }
        if body.is_empty() {
            warn!(location = %page.location, "empty response for error page");
            return;
        }

        let mut headers = HeaderMap::new();
        for name in CACHED_HEADERS {
            for value in parts.headers.get_all(name) {
                headers.append(HeaderName::from_static(name), value.clone());
            }
        }
        page.publish(body, headers);
    }

    /// Look up the page for a status code, synchronously refetching when a
    /// prior fetch left it empty. The page is returned even if the refetch
    /// failed again.
    pub async fn get(&self, code: u16) -> Option<Arc<ErrorPage>> {
        let page = self.pages.lock().get(&code).cloned()?;
        if !page.is_cached() {
            self.fetch(&page).await;
        }
        Some(page)
    }

    /// Response callback body: the substitute response for this status, when
    /// a populated page exists.
    pub async fn check_response(&self, status: StatusCode) -> Option<Response<ProxyBody>> {
        let page = self.get(status.as_u16()).await?;
        let cached = page.cached.lock().clone()?;

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in cached.headers.iter() {
                headers.append(name.clone(), value.clone());
            }
        }
        Some(
            builder
                .body(
                    Full::new(cached.body)
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response with upstream StatusCode"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Serve every request with the given status and body.
    async fn page_origin(status: StatusCode, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        Response::builder()
                            .status(status)
                            .header("Content-Type", "text/html")
                            .header("Cache-Control", "max-age=60")
                            .header("X-Not-Cached", "1")
                            .body(Full::new(Bytes::from_static(body.as_bytes())))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}/503.html", addr)
    }

    async fn wait_for_body(pages: &ErrorPages, code: u16) -> Option<Bytes> {
        for _ in 0..100 {
            if let Some(page) = pages.pages.lock().get(&code).cloned() {
                if let Some(body) = page.body() {
                    return Some(body);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    #[tokio::test]
    async fn caches_page_served_with_its_own_status() {
        let location = page_origin(StatusCode::SERVICE_UNAVAILABLE, "maint").await;
        let mut cfg = HashMap::new();
        cfg.insert(location, vec![503u16, 504u16]);

        let pages = ErrorPages::new(&cfg);
        let body = wait_for_body(&pages, 503).await.expect("page cached");
        assert_eq!(&body[..], b"maint");

        // both statuses share the one page instance
        let for_504 = pages.get(504).await.expect("504 indexed");
        assert_eq!(for_504.body().expect("cached").as_ref(), b"maint");
    }

    #[tokio::test]
    async fn check_response_substitutes_with_allowed_headers() {
        let location = page_origin(StatusCode::OK, "gone fishing").await;
        let mut cfg = HashMap::new();
        cfg.insert(location, vec![502u16]);

        let pages = ErrorPages::new(&cfg);
        wait_for_body(&pages, 502).await.expect("page cached");

        let resp = pages
            .check_response(StatusCode::BAD_GATEWAY)
            .await
            .expect("substitution for 502");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("Content-Type").unwrap(), "text/html");
        assert_eq!(resp.headers().get("Cache-Control").unwrap(), "max-age=60");
        assert!(resp.headers().get("X-Not-Cached").is_none());

        let body = resp.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"gone fishing");
    }

    #[tokio::test]
    async fn unknown_status_passes_through() {
        let pages = ErrorPages::new(&HashMap::new());
        assert!(pages.get(503).await.is_none());
        assert!(pages.check_response(StatusCode::SERVICE_UNAVAILABLE).await.is_none());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_page_empty() {
        // nothing listens here
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let location = format!("http://{}/missing.html", listener.local_addr().expect("addr"));
        drop(listener);

        let mut cfg = HashMap::new();
        cfg.insert(location, vec![503u16]);
        let pages = ErrorPages::new(&cfg);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // present but unpopulated: get() retries and still returns the page
        let page = pages.get(503).await.expect("page indexed");
        assert!(page.body().is_none());
        assert!(pages.check_response(StatusCode::SERVICE_UNAVAILABLE).await.is_none());
    }
}
