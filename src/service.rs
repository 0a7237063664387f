//! A service: one listener, a dynamic backend set, a balancer, and an HTTP
//! reverse proxy.

use crate::backend::{Backend, BackendSettings};
use crate::balance::{Balance, Balancer};
use crate::config::{
    BackendConfig, ServiceConfig, ServiceStat, DEFAULT_CHECK_INTERVAL_MS, DEFAULT_FALL,
    DEFAULT_RISE,
};
use crate::conn::CountedConn;
use crate::error::{DialError, ProxyBody};
use crate::errorpage::ErrorPages;
use crate::proxy::{Callback, ErrStats, ErrorPageCheck, LogRequest, ReverseProxy, SslRedirect};
use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Service {
    pub name: String,
    pub addr: String,
    pub virtual_hosts: Vec<String>,
    /// Balance name as configured; empty means round-robin.
    pub balance: String,

    check_interval: Duration,
    rise: u32,
    fall: u32,
    client_timeout: Option<Duration>,
    server_timeout: Option<Duration>,
    dial_timeout: Option<Duration>,

    backends: RwLock<Vec<Arc<Backend>>>,
    balancer: Option<Balancer>,

    http_conns: AtomicU64,
    http_errors: AtomicU64,
    http_active: AtomicI64,

    // listener-side byte counters fed by accepted connections
    client_sent: Arc<AtomicU64>,
    client_rcvd: Arc<AtomicU64>,

    http_proxy: ReverseProxy,
    error_pages: Arc<ErrorPages>,
    error_pages_cfg: HashMap<String, Vec<u16>>,

    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

fn ms_opt(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl Service {
    /// Build a service from its config, applying defaults and starting the
    /// backend health loops. The listener is not bound until `start`.
    pub fn new(cfg: ServiceConfig, ssl_only: bool) -> Arc<Service> {
        let check_interval = Duration::from_millis(if cfg.check_interval == 0 {
            DEFAULT_CHECK_INTERVAL_MS
        } else {
            cfg.check_interval
        });
        let rise = if cfg.rise == 0 { DEFAULT_RISE } else { cfg.rise };
        let fall = if cfg.fall == 0 { DEFAULT_FALL } else { cfg.fall };

        let balancer = match Balance::parse(&cfg.balance) {
            Some(strategy) => Some(Balancer::new(strategy)),
            None => {
                error!(service = %cfg.name, balance = %cfg.balance, "invalid balancing algorithm");
                None
            }
        };

        let error_pages = ErrorPages::new(&cfg.error_pages);
        let (shutdown, _) = watch::channel(false);

        let service = Arc::new_cyclic(|weak: &Weak<Service>| {
            let on_request: Vec<Box<dyn Callback>> = vec![Box::new(SslRedirect { ssl_only })];
            let on_response: Vec<Box<dyn Callback>> = vec![
                Box::new(LogRequest),
                Box::new(ErrStats {
                    service: weak.clone(),
                }),
                Box::new(ErrorPageCheck {
                    pages: Arc::clone(&error_pages),
                }),
            ];
            Service {
                name: cfg.name.clone(),
                addr: cfg.addr.clone(),
                virtual_hosts: cfg.virtual_hosts.clone(),
                balance: cfg.balance.clone(),
                check_interval,
                rise,
                fall,
                client_timeout: ms_opt(cfg.client_timeout),
                server_timeout: ms_opt(cfg.server_timeout),
                dial_timeout: ms_opt(cfg.dial_timeout),
                backends: RwLock::new(Vec::new()),
                balancer,
                http_conns: AtomicU64::new(0),
                http_errors: AtomicU64::new(0),
                http_active: AtomicI64::new(0),
                client_sent: Arc::new(AtomicU64::new(0)),
                client_rcvd: Arc::new(AtomicU64::new(0)),
                http_proxy: ReverseProxy::new(on_request, on_response),
                error_pages: Arc::clone(&error_pages),
                error_pages_cfg: cfg.error_pages.clone(),
                local_addr: RwLock::new(None),
                shutdown,
            }
        });

        for backend_cfg in cfg.backends {
            service.add_backend(backend_cfg);
        }
        service
    }

    fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            rw_timeout: self.server_timeout,
            dial_timeout: self.dial_timeout,
            check_interval: self.check_interval,
            rise: self.rise,
            fall: self.fall,
        }
    }

    /// Add or replace a backend; a same-named backend is stopped and
    /// swapped, its health loop replaced by the new one's.
    pub fn add_backend(&self, cfg: BackendConfig) {
        let backend = Backend::new(cfg, self.backend_settings());
        info!(service = %self.name, backend = %backend.name, addr = %backend.addr, "adding backend");

        {
            let mut backends = self.backends.write();
            if let Some(existing) = backends.iter_mut().find(|b| b.name == backend.name) {
                existing.stop();
                *existing = Arc::clone(&backend);
            } else {
                backends.push(Arc::clone(&backend));
            }
        }
        backend.start();
    }

    /// Remove a backend by name, stopping its health loop.
    pub fn remove_backend(&self, name: &str) -> bool {
        let removed = {
            let mut backends = self.backends.write();
            backends
                .iter()
                .position(|b| b.name == name)
                .map(|pos| backends.remove(pos))
        };
        match removed {
            Some(backend) => {
                info!(service = %self.name, backend = %name, addr = %backend.addr, "removing backend");
                backend.stop();
                true
            }
            None => false,
        }
    }

    pub fn get_backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.read().iter().find(|b| b.name == name).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }

    /// Reconcile the backend set against `cfgs` without touching the
    /// listener: add new, replace changed, remove absent. Unchanged
    /// same-named backends keep their health loop and counters.
    pub fn update_backends(&self, cfgs: &[BackendConfig]) {
        for cfg in cfgs {
            let unchanged = self
                .get_backend(&cfg.name)
                .map(|b| b.config() == *cfg)
                .unwrap_or(false);
            if !unchanged {
                self.add_backend(cfg.clone());
            }
        }

        let mut removed = Vec::new();
        {
            let mut backends = self.backends.write();
            backends.retain(|b| {
                if cfgs.iter().any(|c| c.name == b.name) {
                    true
                } else {
                    removed.push(Arc::clone(b));
                    false
                }
            });
        }
        for backend in removed {
            info!(service = %self.name, backend = %backend.name, "removing backend");
            backend.stop();
        }
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self: &Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.write() = Some(local);
        info!(service = %self.name, addr = %local, "listening");

        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let service = Arc::clone(&service);
                                tokio::spawn(async move {
                                    let client = CountedConn::new(
                                        stream,
                                        service.client_timeout,
                                        service.client_sent.clone(),
                                        service.client_rcvd.clone(),
                                        None,
                                    );
                                    service.connect(client, peer).await;
                                });
                            }
                            Err(e) => {
                                warn!(service = %service.name, error = %e, "accept failed");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(service = %service.name, "accept loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Close the listener and stop every backend. Safe to call repeatedly
    /// and when the listener never bound.
    pub fn stop(&self) {
        info!(service = %self.name, addr = %self.addr, "stopping");
        let _ = self.shutdown.send(true);
        for backend in self.backends.read().iter() {
            backend.stop();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Ordered candidates for the next connection; `None` when the
    /// configured balance algorithm was invalid.
    fn next_backends(&self) -> Option<Vec<Arc<Backend>>> {
        let balancer = self.balancer.as_ref()?;
        let backends = self.backends.read().clone();
        Some(balancer.next(&backends))
    }

    /// Backend addresses in balancing order, for the HTTP pipeline.
    pub fn next_addrs(&self) -> Vec<String> {
        self.next_backends()
            .map(|backends| backends.iter().map(|b| b.addr.clone()).collect())
            .unwrap_or_default()
    }

    /// Forward one accepted connection to the first backend that dials.
    /// Dropping the client closes it when every candidate fails.
    async fn connect<C>(&self, client: C, peer: SocketAddr)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(ordered) = self.next_backends() else {
            error!(service = %self.name, peer = %peer, "no balancer configured, closing connection");
            return;
        };

        let mut client = Some(client);
        for backend in &ordered {
            match self.dial_raw(&backend.addr).await {
                Ok(server) => {
                    if let Some(client) = client.take() {
                        backend.proxy(server, client).await;
                    }
                    return;
                }
                Err(e) => {
                    error!(service = %self.name, backend = %backend.name, error = %e,
                        "error connecting to backend");
                    backend.record_error();
                }
            }
        }
        error!(service = %self.name, peer = %peer, "no backend available");
    }

    async fn dial_raw(&self, addr: &str) -> io::Result<TcpStream> {
        match self.dial_timeout {
            Some(t) => tokio::time::timeout(t, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
            None => TcpStream::connect(addr).await,
        }
    }

    /// Dial a backend by address for the HTTP proxy, wiring the connection
    /// into that backend's byte counters and http-active gauge. Failures are
    /// dial-phase and therefore safe to retry against another address.
    pub async fn dial(&self, addr: &str) -> Result<CountedConn<TcpStream>, DialError> {
        let backend = {
            let backends = self.backends.read();
            backends.iter().find(|b| b.addr == addr).cloned()
        };
        let Some(backend) = backend else {
            return Err(DialError::NoBackend(addr.to_string()));
        };

        let stream = match self.dial_raw(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(service = %self.name, backend = %backend.name, error = %e,
                    "error connecting to backend");
                backend.record_error();
                return Err(if e.kind() == io::ErrorKind::TimedOut {
                    DialError::Timeout(addr.to_string())
                } else {
                    DialError::Connect(e)
                });
            }
        };

        backend.record_conn();
        let (sent, rcvd, http_active) = backend.http_conn_counters();
        Ok(CountedConn::new(
            stream,
            self.server_timeout,
            sent,
            rcvd,
            Some(http_active),
        ))
    }

    /// HTTP entry point used by the virtual-host router.
    pub async fn serve_http(
        self: &Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        self.http_conns.fetch_add(1, Ordering::Relaxed);
        self.http_active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(&self.http_active);

        let addrs = self.next_addrs();
        self.http_proxy.serve(self, req, addrs, client_addr).await
    }

    pub fn record_http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_active(&self) -> i64 {
        self.http_active.load(Ordering::SeqCst)
    }

    /// The error-page cache serving this service's substitutions.
    pub fn error_pages(&self) -> &Arc<ErrorPages> {
        &self.error_pages
    }

    pub fn stats(&self) -> ServiceStat {
        let backends = self.backends.read().clone();
        let mut stat = ServiceStat {
            name: self.name.clone(),
            addr: self.addr.clone(),
            virtual_hosts: self.virtual_hosts.clone(),
            balance: self.balance.clone(),
            check_interval: self.check_interval.as_millis() as u64,
            fall: self.fall,
            rise: self.rise,
            client_timeout: self.client_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            server_timeout: self.server_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            dial_timeout: self.dial_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            http_connections: self.http_conns.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            http_active: self.http_active.load(Ordering::SeqCst),
            ..Default::default()
        };

        for backend in &backends {
            let bs = backend.stats();
            stat.sent += bs.sent;
            stat.received += bs.received;
            stat.errors += bs.errors;
            stat.connections += bs.connections;
            stat.active += bs.active;
            stat.backends.push(bs);
        }
        stat
    }

    /// The effective running config, defaults included.
    pub fn config(&self) -> ServiceConfig {
        ServiceConfig {
            name: self.name.clone(),
            addr: self.addr.clone(),
            virtual_hosts: self.virtual_hosts.clone(),
            backends: self
                .backends
                .read()
                .iter()
                .map(|b| b.config())
                .collect(),
            balance: self.balance.clone(),
            check_interval: self.check_interval.as_millis() as u64,
            fall: self.fall,
            rise: self.rise,
            client_timeout: self.client_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            server_timeout: self.server_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            dial_timeout: self.dial_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            error_pages: self.error_pages_cfg.clone(),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicI64);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection and write `banner` to it.
    async fn banner_backend(banner: &'static str) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let _ = sock.write_all(banner.as_bytes()).await;
            }
        });
        (addr, handle)
    }

    fn dead_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        addr
    }

    fn service_config(backends: Vec<BackendConfig>) -> ServiceConfig {
        ServiceConfig {
            name: "web".to_string(),
            addr: "127.0.0.1:0".to_string(),
            backends,
            // long interval so checks never flip state during the test
            check_interval: 60_000,
            dial_timeout: 200,
            ..Default::default()
        }
    }

    async fn read_banner(addr: SocketAddr) -> String {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let mut banner = String::new();
        conn.read_to_string(&mut banner).await.expect("read");
        banner
    }

    #[tokio::test]
    async fn round_robin_skips_dead_backend() {
        let (addr_b, _b) = banner_backend("B").await;
        let (addr_c, _c) = banner_backend("C").await;
        let dead = dead_addr();

        let service = Service::new(
            service_config(vec![
                BackendConfig {
                    name: "a".to_string(),
                    addr: dead,
                    ..Default::default()
                },
                BackendConfig {
                    name: "b".to_string(),
                    addr: addr_b,
                    ..Default::default()
                },
                BackendConfig {
                    name: "c".to_string(),
                    addr: addr_c,
                    ..Default::default()
                },
            ]),
            false,
        );
        service.start().await.expect("start");
        let addr = service.local_addr().expect("bound");

        // rotation lands on b, c, then a whose dial fails over to b
        assert_eq!(read_banner(addr).await, "B");
        assert_eq!(read_banner(addr).await, "C");
        assert_eq!(read_banner(addr).await, "B");

        let stats = service.stats();
        let a = stats.backends.iter().find(|b| b.name == "a").expect("a");
        assert_eq!(a.errors, 1, "one failed dial against the dead backend");

        service.stop();
    }

    #[tokio::test]
    async fn empty_backend_set_closes_client() {
        let service = Service::new(service_config(Vec::new()), false);
        service.start().await.expect("start");
        let addr = service.local_addr().expect("bound");

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let mut buf = Vec::new();
        // server closes without writing anything
        conn.read_to_end(&mut buf).await.expect("read");
        assert!(buf.is_empty());

        service.stop();
    }

    #[tokio::test]
    async fn invalid_balance_closes_connections() {
        let (addr_b, _b) = banner_backend("B").await;
        let mut cfg = service_config(vec![BackendConfig {
            name: "b".to_string(),
            addr: addr_b,
            ..Default::default()
        }]);
        cfg.balance = "bogus".to_string();

        let service = Service::new(cfg, false);
        service.start().await.expect("start");
        let addr = service.local_addr().expect("bound");

        let mut conn = TcpStream::connect(addr).await.expect("connect");
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.expect("read");
        assert!(buf.is_empty(), "no selector, connection just closes");

        service.stop();
    }

    #[tokio::test]
    async fn stop_unblocks_new_connections() {
        let (addr_b, _b) = banner_backend("B").await;
        let service = Service::new(
            service_config(vec![BackendConfig {
                name: "b".to_string(),
                addr: addr_b,
                ..Default::default()
            }]),
            false,
        );
        service.start().await.expect("start");
        let addr = service.local_addr().expect("bound");
        service.stop();
        service.stop(); // idempotent

        // give the accept loop a beat to wind down, then the port is closed
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn update_backends_reconciles_in_place() {
        let (addr_b, _b) = banner_backend("B").await;
        let (addr_d, _d) = banner_backend("D").await;

        let service = Service::new(
            service_config(vec![
                BackendConfig {
                    name: "a".to_string(),
                    addr: dead_addr(),
                    ..Default::default()
                },
                BackendConfig {
                    name: "b".to_string(),
                    addr: addr_b.clone(),
                    ..Default::default()
                },
            ]),
            false,
        );
        service.start().await.expect("start");
        let before = service.get_backend("b").expect("b");

        service.update_backends(&[
            BackendConfig {
                name: "b".to_string(),
                addr: addr_b,
                ..Default::default()
            },
            BackendConfig {
                name: "d".to_string(),
                addr: addr_d,
                ..Default::default()
            },
        ]);

        assert!(service.get_backend("a").is_none(), "a removed");
        assert!(service.get_backend("d").is_some(), "d added");
        let after = service.get_backend("b").expect("b");
        assert!(
            Arc::ptr_eq(&before, &after),
            "unchanged backend not replaced"
        );

        service.stop();
    }
}
