//! The HTTP front door: Host-header dispatch to services.
//!
//! A single listener serves every virtual host. Requests whose Host header
//! resolves to a service are handed to that service's reverse proxy;
//! everything else gets the admin fallback.

use crate::config::ServiceStat;
use crate::conn::CountedConn;
use crate::error::ProxyBody;
use crate::registry::ServiceRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-operation idle deadline on accepted front-door sockets. Long enough
/// for keep-alive reuse, short enough to shed dead peers.
const ROUTER_IO_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HostRouter {
    registry: Arc<ServiceRegistry>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    // listener-level byte counters fed by the connection wrappers
    sent: Arc<AtomicU64>,
    rcvd: Arc<AtomicU64>,
}

impl HostRouter {
    /// Bind the front-door listener. A successful return is the readiness
    /// signal; `run` starts accepting.
    pub async fn bind(
        addr: &str,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<HostRouter> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "http router listening");
        Ok(HostRouter {
            registry,
            listener,
            local_addr,
            shutdown_rx,
            sent: Arc::new(AtomicU64::new(0)),
            rcvd: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let conn = CountedConn::new(
                                stream,
                                Some(ROUTER_IO_TIMEOUT),
                                self.sent.clone(),
                                self.rcvd.clone(),
                                None,
                            );
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(conn, peer, registry).await {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("http router shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(
    conn: CountedConn<TcpStream>,
    peer: SocketAddr,
    registry: Arc<ServiceRegistry>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(conn);
    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        async move { Ok::<_, hyper::Error>(route(req, peer, registry).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;
    Ok(())
}

async fn route(
    mut req: Request<Incoming>,
    peer: SocketAddr,
    registry: Arc<ServiceRegistry>,
) -> Response<ProxyBody> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert("x-request-id", value);
    }
    let start = Instant::now();

    let service = match hostname(&req) {
        Some(host) => registry.get_vhost_service(&host).await,
        None => None,
    };

    let resp = match service {
        Some(service) => service.serve_http(req, peer).await,
        None => admin_fallback(&registry).await,
    };

    debug!(id = %request_id, duration = ?start.elapsed(), "request complete");
    resp
}

/// Lowercased Host header with any port stripped.
fn hostname<B>(req: &Request<B>) -> Option<String> {
    let host = match req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => host,
        None => req.uri().host()?,
    };
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Fallback for requests no virtual host claims: 503 when nothing is
/// routable at all, otherwise a plain-text dump of vhosts and backends.
async fn admin_fallback(registry: &ServiceRegistry) -> Response<ProxyBody> {
    if registry.vhosts_len().await == 0 {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "no backends available\n");
    }

    let mut out = String::new();
    for stat in registry.stats().await {
        if stat.virtual_hosts.is_empty() {
            continue;
        }
        dump_service(&mut out, &stat);
    }
    out.push('\n');
    text_response(StatusCode::OK, out)
}

fn dump_service(out: &mut String, stat: &ServiceStat) {
    let _ = writeln!(out, "{:?}", stat.virtual_hosts);
    for backend in &stat.backends {
        let js = serde_json::to_string(backend).unwrap_or_default();
        let _ = writeln!(out, "\t{}", js);
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(body.into())
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}
