//! A single upstream endpoint: health checking, stats, and TCP pair
//! proxying.

use crate::config::{BackendConfig, BackendStat};
use crate::conn::CountedConn;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Settings a backend inherits from its owning service.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    pub rw_timeout: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub check_interval: Duration,
    pub rise: u32,
    pub fall: u32,
}

pub struct Backend {
    pub name: String,
    pub addr: String,
    pub check_addr: String,
    weight: u32,

    rw_timeout: Option<Duration>,
    dial_timeout: Option<Duration>,
    check_interval: Duration,
    rise: u32,
    fall: u32,

    up: AtomicBool,
    sent: Arc<AtomicU64>,
    rcvd: Arc<AtomicU64>,
    errors: AtomicU64,
    conns: AtomicU64,
    active: Arc<AtomicI64>,
    http_active: Arc<AtomicI64>,
    check_fail: AtomicU64,

    shutdown: watch::Sender<bool>,
}

impl Backend {
    /// Build a backend from its config. New backends start up; the health
    /// loop takes over once `start` is called.
    pub fn new(cfg: BackendConfig, settings: BackendSettings) -> Arc<Backend> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Backend {
            name: cfg.name,
            addr: cfg.addr,
            check_addr: cfg.check_addr,
            weight: cfg.weight,
            rw_timeout: settings.rw_timeout,
            dial_timeout: settings.dial_timeout,
            check_interval: settings.check_interval,
            rise: settings.rise,
            fall: settings.fall,
            up: AtomicBool::new(true),
            sent: Arc::new(AtomicU64::new(0)),
            rcvd: Arc::new(AtomicU64::new(0)),
            errors: AtomicU64::new(0),
            conns: AtomicU64::new(0),
            active: Arc::new(AtomicI64::new(0)),
            http_active: Arc::new(AtomicI64::new(0)),
            check_fail: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Spawn the health-check task. It runs until `stop` signals it.
    pub fn start(self: &Arc<Self>) {
        let backend = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let checker = backend.http_checker();
            let mut successes = 0u32;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(backend.check_interval) => {
                        if backend.check(&checker).await {
                            failures = 0;
                            successes = successes.saturating_add(1);
                            if !backend.up.load(Ordering::SeqCst) && successes >= backend.rise {
                                backend.up.store(true, Ordering::SeqCst);
                                info!(backend = %backend.name, addr = %backend.addr, "backend is up");
                            }
                        } else {
                            successes = 0;
                            failures = failures.saturating_add(1);
                            backend.check_fail.fetch_add(1, Ordering::Relaxed);
                            if backend.up.load(Ordering::SeqCst) && failures >= backend.fall {
                                backend.up.store(false, Ordering::SeqCst);
                                warn!(backend = %backend.name, addr = %backend.addr, failures, "backend is down");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(backend = %backend.name, "health check stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the health-check task. Safe to call repeatedly.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The HTTP probe client and URI when a check address is configured.
    fn http_checker(&self) -> Option<(Client<HttpConnector, Empty<Bytes>>, Uri)> {
        if self.check_addr.is_empty() {
            return None;
        }
        let uri: Uri = match self.check_addr.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %self.name, check_addr = %self.check_addr, error = %e,
                    "invalid check address, falling back to TCP checks");
                return None;
            }
        };
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Some((client, uri))
    }

    /// Run one health check: an HTTP GET bounded by half the check interval,
    /// or a plain TCP connect bounded by the dial timeout.
    async fn check(&self, checker: &Option<(Client<HttpConnector, Empty<Bytes>>, Uri)>) -> bool {
        match checker {
            Some((client, uri)) => {
                let probe = async {
                    let req = Request::builder()
                        .uri(uri.clone())
                        .body(Empty::<Bytes>::new())
                        .expect("valid GET request from parsed uri");
                    let resp = client.request(req).await.ok()?;
                    if !resp.status().is_success() {
                        return None;
                    }
                    resp.into_body().collect().await.ok()?;
                    Some(())
                };
                matches!(
                    tokio::time::timeout(self.check_interval / 2, probe).await,
                    Ok(Some(()))
                )
            }
            None => {
                let connect = TcpStream::connect(&self.addr);
                let result = match self.dial_timeout {
                    Some(t) => match tokio::time::timeout(t, connect).await {
                        Ok(r) => r,
                        Err(_) => return false,
                    },
                    None => connect.await,
                };
                result.is_ok()
            }
        }
    }

    /// Forward bytes between a dialed backend connection and a client until
    /// either side closes. Byte counters and the active gauge ride on the
    /// wrapped backend side.
    pub async fn proxy<C>(&self, server: TcpStream, mut client: C)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        self.conns.fetch_add(1, Ordering::Relaxed);
        let mut server = CountedConn::new(
            server,
            self.rw_timeout,
            self.sent.clone(),
            self.rcvd.clone(),
            Some(self.active.clone()),
        );
        match tokio::io::copy_bidirectional(&mut client, &mut server).await {
            Ok((to_server, to_client)) => {
                debug!(backend = %self.name, to_server, to_client, "connection closed");
            }
            Err(e) => {
                debug!(backend = %self.name, error = %e, "connection closed with error");
            }
        }
    }

    pub fn up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Seed the up state, used to carry health across a service replacement.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter handles wired into upstream HTTP connections by
    /// `Service::dial`.
    pub(crate) fn http_conn_counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>, Arc<AtomicI64>) {
        (
            self.sent.clone(),
            self.rcvd.clone(),
            self.http_active.clone(),
        )
    }

    #[cfg(test)]
    pub(crate) fn active_gauge(&self) -> Arc<AtomicI64> {
        self.active.clone()
    }

    pub fn stats(&self) -> BackendStat {
        BackendStat {
            name: self.name.clone(),
            addr: self.addr.clone(),
            check_addr: self.check_addr.clone(),
            up: self.up(),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.rcvd.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connections: self.conns.load(Ordering::Relaxed),
            active: self.active.load(Ordering::SeqCst),
            http_active: self.http_active.load(Ordering::SeqCst),
            check_fail: self.check_fail.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            name: self.name.clone(),
            addr: self.addr.clone(),
            check_addr: self.check_addr.clone(),
            weight: self.weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings(check_interval: Duration) -> BackendSettings {
        BackendSettings {
            rw_timeout: None,
            dial_timeout: Some(Duration::from_millis(100)),
            check_interval,
            rise: 2,
            fall: 2,
        }
    }

    async fn wait_for_up(backend: &Backend, want: bool) -> bool {
        for _ in 0..100 {
            if backend.up() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn falls_after_consecutive_check_failures() {
        // nothing listens on this port once the listener drops
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let backend = Backend::new(
            BackendConfig {
                name: "b1".to_string(),
                addr,
                ..Default::default()
            },
            settings(Duration::from_millis(20)),
        );
        assert!(backend.up(), "backends start up");

        backend.start();
        assert!(wait_for_up(&backend, false).await, "backend should fall");
        assert!(backend.stats().check_fail >= 2);
        backend.stop();
    }

    #[tokio::test]
    async fn rises_after_consecutive_check_successes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let backend = Backend::new(
            BackendConfig {
                name: "b1".to_string(),
                addr,
                ..Default::default()
            },
            settings(Duration::from_millis(20)),
        );
        backend.set_up(false);

        // accept and drop connections so the TCP probe succeeds
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        backend.start();
        assert!(wait_for_up(&backend, true).await, "backend should rise");
        backend.stop();
        accept.abort();
    }

    #[tokio::test]
    async fn proxy_copies_both_directions_and_counts() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        // echo server standing in for the upstream
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.expect("read");
            sock.write_all(&buf).await.expect("write");
        });

        let backend = Backend::new(
            BackendConfig {
                name: "b1".to_string(),
                addr: addr.clone(),
                ..Default::default()
            },
            settings(Duration::from_secs(60)),
        );

        let (mut client, proxy_side) = tokio::io::duplex(64);
        let server = TcpStream::connect(&addr).await.expect("connect");
        let b = Arc::clone(&backend);
        let copy = tokio::spawn(async move { b.proxy(server, proxy_side).await });

        client.write_all(b"ping").await.expect("client write");
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.expect("client read");
        assert_eq!(&buf, b"ping");
        drop(client);
        copy.await.expect("proxy task");

        let stats = backend.stats();
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.active, 0, "gauge returns to zero after close");
    }
}
