//! Admin API: CRUD over services and backends.
//!
//! Listens on TCP, or on a UNIX socket when the configured address starts
//! with '/'. Payloads are the `ServiceConfig`/`BackendConfig` wire shapes;
//! every successful write answers with the full registry config.

use crate::config::{BackendConfig, ServiceConfig};
use crate::registry::ServiceRegistry;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Helper to create a simple response.
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response.
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

trait AdminStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AdminStream for T {}

impl Listener {
    async fn accept(&self) -> io::Result<Box<dyn AdminStream>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

pub struct AdminServer {
    listener: Listener,
    local_addr: Option<SocketAddr>,
    socket_path: Option<String>,
    registry: Arc<ServiceRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    /// Listener ports no service may claim (the proxy's own).
    reserved_ports: Arc<Vec<String>>,
}

impl AdminServer {
    /// Bind the admin listener. An address starting with '/' is a UNIX
    /// socket path; a stale socket file from an unclean shutdown is removed
    /// first.
    pub async fn bind(
        addr: &str,
        registry: Arc<ServiceRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        reserved_ports: Vec<String>,
    ) -> anyhow::Result<AdminServer> {
        let (listener, local_addr, socket_path) = if addr.starts_with('/') {
            remove_stale_socket(Path::new(addr));
            (
                Listener::Unix(UnixListener::bind(addr)?),
                None,
                Some(addr.to_string()),
            )
        } else {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            (Listener::Tcp(listener), Some(local), None)
        };

        info!(addr, "admin server listening");
        Ok(AdminServer {
            listener,
            local_addr,
            socket_path,
            registry,
            shutdown_rx,
            reserved_ports: Arc::new(reserved_ports),
        })
    }

    /// Bound TCP address, when not on a UNIX socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(stream) => {
                            let registry = Arc::clone(&self.registry);
                            let reserved = Arc::clone(&self.reserved_ports);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, registry, reserved).await {
                                    debug!(error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "admin accept failed");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("admin server shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: Box<dyn AdminStream>,
    registry: Arc<ServiceRegistry>,
    reserved_ports: Arc<Vec<String>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let reserved = Arc::clone(&reserved_ports);
        async move { Ok::<_, hyper::Error>(handle(req, registry, reserved).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    registry: Arc<ServiceRegistry>,
    reserved_ports: Arc<Vec<String>>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };
    let backends_only = req
        .uri()
        .query()
        .map(|q| {
            q.split('&')
                .any(|p| p == "backends_only" || p.starts_with("backends_only="))
        })
        .unwrap_or(false);

    match (method, segments.as_slice()) {
        (Method::GET, []) => get_stats(&registry).await,
        (Method::GET, ["_config"]) => config_response(&registry, StatusCode::OK).await,
        (Method::GET, [service]) => get_service(&registry, service).await,
        (Method::PUT | Method::POST, [service]) => {
            let service = service.to_string();
            post_service(&registry, &service, req, &reserved_ports, backends_only).await
        }
        (Method::DELETE, [service]) => delete_service(&registry, service).await,
        (Method::GET, [service, backend]) => get_backend(&registry, service, backend).await,
        (Method::PUT | Method::POST, [service, backend]) => {
            let (service, backend) = (service.to_string(), backend.to_string());
            post_backend(&registry, &service, &backend, req).await
        }
        (Method::DELETE, [service, backend]) => delete_backend(&registry, service, backend).await,
        _ => response(StatusCode::NOT_FOUND, "not found\n"),
    }
}

/// Full registry config, the response to every successful write.
async fn config_response(registry: &ServiceRegistry, status: StatusCode) -> Response<Full<Bytes>> {
    match serde_json::to_vec(&registry.config().await) {
        Ok(body) => json_response(status, body),
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
    }
}

async fn get_stats(registry: &ServiceRegistry) -> Response<Full<Bytes>> {
    let stats = registry.stats().await;
    let status = if stats.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    match serde_json::to_vec(&stats) {
        Ok(body) => json_response(status, body),
        Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
    }
}

async fn get_service(registry: &ServiceRegistry, name: &str) -> Response<Full<Bytes>> {
    match registry.service_stats(name).await {
        Some(stats) => match serde_json::to_vec(&stats) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
        },
        None => response(StatusCode::NOT_FOUND, format!("service {} not found\n", name)),
    }
}

async fn post_service(
    registry: &ServiceRegistry,
    name: &str,
    req: Request<Incoming>,
    reserved_ports: &[String],
    backends_only: bool,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e));
        }
    };

    let mut cfg: ServiceConfig = match serde_json::from_slice(&body) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(service = name, error = %e, "invalid service config");
            return response(StatusCode::BAD_REQUEST, format!("invalid config: {}\n", e));
        }
    };
    cfg.name = name.to_string();

    if let Some(port) = addr_port(&cfg.addr) {
        if reserved_ports.iter().any(|p| p == port) {
            error!(service = name, port, "service listener port collides with the proxy's own");
            return response(
                StatusCode::BAD_REQUEST,
                format!("cannot use port {} for listener\n", port),
            );
        }
    }

    let result = if registry.get_service(&cfg.name).await.is_none() {
        registry.add_service(cfg).await
    } else if backends_only {
        registry.update_service_backends(cfg).await
    } else {
        registry.update_service(cfg).await
    };

    match result {
        Ok(()) => config_response(registry, StatusCode::OK).await,
        Err(e) => response(e.status(), format!("{}\n", e)),
    }
}

async fn delete_service(registry: &ServiceRegistry, name: &str) -> Response<Full<Bytes>> {
    match registry.remove_service(name).await {
        Ok(()) => config_response(registry, StatusCode::OK).await,
        Err(e) => response(e.status(), format!("{}\n", e)),
    }
}

async fn get_backend(
    registry: &ServiceRegistry,
    service: &str,
    backend: &str,
) -> Response<Full<Bytes>> {
    match registry.backend_stats(service, backend).await {
        Some(stats) => match serde_json::to_vec(&stats) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
        },
        None => response(
            StatusCode::NOT_FOUND,
            format!("backend {}/{} not found\n", service, backend),
        ),
    }
}

async fn post_backend(
    registry: &ServiceRegistry,
    service: &str,
    backend: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e));
        }
    };

    let mut cfg: BackendConfig = match serde_json::from_slice(&body) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(service, backend, error = %e, "invalid backend config");
            return response(StatusCode::BAD_REQUEST, format!("invalid config: {}\n", e));
        }
    };
    cfg.name = backend.to_string();

    match registry.add_backend(service, cfg).await {
        Ok(()) => config_response(registry, StatusCode::OK).await,
        Err(e) => response(e.status(), format!("{}\n", e)),
    }
}

async fn delete_backend(
    registry: &ServiceRegistry,
    service: &str,
    backend: &str,
) -> Response<Full<Bytes>> {
    match registry.remove_backend(service, backend).await {
        Ok(()) => config_response(registry, StatusCode::OK).await,
        Err(e) => response(e.status(), format!("{}\n", e)),
    }
}

/// Remove a socket file left behind by an unclean shutdown. Anything that
/// is not a socket is left alone.
fn remove_stale_socket(path: &Path) {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_socket() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The port suffix of a host:port address.
fn addr_port(addr: &str) -> Option<&str> {
    let (_, port) = addr.rsplit_once(':')?;
    if port.is_empty() {
        None
    } else {
        Some(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_port_extracts_suffix() {
        assert_eq!(addr_port("127.0.0.1:8080"), Some("8080"));
        assert_eq!(addr_port("localhost:80"), Some("80"));
        assert_eq!(addr_port("nohost"), None);
        assert_eq!(addr_port("bad:"), None);
    }
}
