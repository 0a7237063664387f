//! Indexed collection of services and their virtual hosts.
//!
//! One mutex guards both indices, so lookups never observe a half-applied
//! reconfiguration. Registry operations may call into a service, which has
//! its own locking; the order is always registry, then service, then
//! backend.

use crate::config::{BackendConfig, BackendStat, ServiceConfig, ServiceStat};
use crate::service::Service;
use hyper::StatusCode;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
pub enum RegistryError {
    ServiceExists(String),
    NoService(String),
    NoBackend(String, String),
    VHostTaken { host: String, service: String },
    Bind(io::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ServiceExists(name) => write!(f, "service {} already exists", name),
            RegistryError::NoService(name) => write!(f, "service {} not found", name),
            RegistryError::NoBackend(service, backend) => {
                write!(f, "backend {}/{} not found", service, backend)
            }
            RegistryError::VHostTaken { host, service } => {
                write!(f, "virtual host {} already routed to {}", host, service)
            }
            RegistryError::Bind(e) => write!(f, "could not bind listener: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl RegistryError {
    /// Status the admin API answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RegistryError::NoService(_) | RegistryError::NoBackend(_, _) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Default)]
struct Inner {
    svcs: HashMap<String, Arc<Service>>,
    vhosts: HashMap<String, Arc<Service>>,
}

pub struct ServiceRegistry {
    inner: Mutex<Inner>,
    ssl_only: bool,
}

impl ServiceRegistry {
    pub fn new(ssl_only: bool) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry {
            inner: Mutex::new(Inner::default()),
            ssl_only,
        })
    }

    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.inner.lock().await.svcs.get(name).cloned()
    }

    /// Exact-hostname lookup; the router strips any port first.
    pub async fn get_vhost_service(&self, host: &str) -> Option<Arc<Service>> {
        self.inner.lock().await.vhosts.get(&host.to_lowercase()).cloned()
    }

    pub async fn vhosts_len(&self) -> usize {
        self.inner.lock().await.vhosts.len()
    }

    /// Construct, start, and index a new service. Fails without side effects
    /// when the name or any virtual host is already claimed; a listener bind
    /// failure leaves nothing registered.
    pub async fn add_service(&self, cfg: ServiceConfig) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        if inner.svcs.contains_key(&cfg.name) {
            return Err(RegistryError::ServiceExists(cfg.name));
        }
        check_vhosts(&inner, &cfg)?;

        info!(service = %cfg.name, addr = %cfg.addr, "adding service");
        let service = Service::new(cfg, self.ssl_only);
        if let Err(e) = service.start().await {
            service.stop();
            return Err(RegistryError::Bind(e));
        }
        index_service(&mut inner, service);
        Ok(())
    }

    /// Replace a service with a new config. An equal config is a no-op; an
    /// unequal one stops the old service, starts a replacement, carries
    /// backend up/down state across by name, and atomically rewrites the
    /// vhost index.
    pub async fn update_service(&self, cfg: ServiceConfig) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.svcs.get(&cfg.name).cloned() else {
            return Err(RegistryError::NoService(cfg.name));
        };
        if existing.config().matches(&cfg) {
            debug!(service = %cfg.name, "config unchanged, skipping update");
            return Ok(());
        }
        check_vhosts(&inner, &cfg)?;

        info!(service = %cfg.name, "replacing service");
        let service = Service::new(cfg, self.ssl_only);
        for backend in service.backends() {
            if let Some(old) = existing.get_backend(&backend.name) {
                backend.set_up(old.up());
            }
        }

        existing.stop();
        unindex_service(&mut inner, &existing);

        if let Err(e) = service.start().await {
            service.stop();
            return Err(RegistryError::Bind(e));
        }
        index_service(&mut inner, service);
        Ok(())
    }

    /// Mutate only a service's backend set, leaving its listener running.
    pub async fn update_service_backends(&self, cfg: ServiceConfig) -> Result<(), RegistryError> {
        let inner = self.inner.lock().await;
        let Some(service) = inner.svcs.get(&cfg.name).cloned() else {
            return Err(RegistryError::NoService(cfg.name));
        };
        service.update_backends(&cfg.backends);
        Ok(())
    }

    pub async fn remove_service(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        let Some(service) = inner.svcs.remove(name) else {
            return Err(RegistryError::NoService(name.to_string()));
        };
        inner.vhosts.retain(|_, s| !Arc::ptr_eq(s, &service));
        service.stop();
        Ok(())
    }

    /// Delegate a backend add; a duplicate name replaces in place.
    pub async fn add_backend(&self, service: &str, cfg: BackendConfig) -> Result<(), RegistryError> {
        let svc = self
            .get_service(service)
            .await
            .ok_or_else(|| RegistryError::NoService(service.to_string()))?;
        svc.add_backend(cfg);
        Ok(())
    }

    pub async fn remove_backend(&self, service: &str, backend: &str) -> Result<(), RegistryError> {
        let svc = self
            .get_service(service)
            .await
            .ok_or_else(|| RegistryError::NoService(service.to_string()))?;
        if svc.remove_backend(backend) {
            Ok(())
        } else {
            Err(RegistryError::NoBackend(
                service.to_string(),
                backend.to_string(),
            ))
        }
    }

    pub async fn service_stats(&self, name: &str) -> Option<ServiceStat> {
        Some(self.get_service(name).await?.stats())
    }

    pub async fn backend_stats(&self, service: &str, backend: &str) -> Option<BackendStat> {
        Some(self.get_service(service).await?.get_backend(backend)?.stats())
    }

    /// Snapshot of every service config, sorted by name.
    pub async fn config(&self) -> Vec<ServiceConfig> {
        let inner = self.inner.lock().await;
        let mut configs: Vec<ServiceConfig> = inner.svcs.values().map(|s| s.config()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Snapshot of every service's stats, sorted by name.
    pub async fn stats(&self) -> Vec<ServiceStat> {
        let inner = self.inner.lock().await;
        let mut stats: Vec<ServiceStat> = inner.svcs.values().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop every service, used at process shutdown.
    pub async fn stop_all(&self) {
        let inner = self.inner.lock().await;
        for service in inner.svcs.values() {
            service.stop();
        }
    }
}

fn check_vhosts(inner: &Inner, cfg: &ServiceConfig) -> Result<(), RegistryError> {
    for host in &cfg.virtual_hosts {
        if let Some(owner) = inner.vhosts.get(&host.to_lowercase()) {
            if owner.name != cfg.name {
                return Err(RegistryError::VHostTaken {
                    host: host.clone(),
                    service: owner.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn index_service(inner: &mut Inner, service: Arc<Service>) {
    for host in &service.virtual_hosts {
        inner.vhosts.insert(host.to_lowercase(), Arc::clone(&service));
    }
    inner.svcs.insert(service.name.clone(), service);
}

fn unindex_service(inner: &mut Inner, service: &Arc<Service>) {
    inner.vhosts.retain(|_, s| !Arc::ptr_eq(s, service));
    inner.svcs.remove(&service.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, vhosts: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            addr: "127.0.0.1:0".to_string(),
            virtual_hosts: vhosts.iter().map(|s| s.to_string()).collect(),
            check_interval: 60_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_and_lookup_by_name_and_vhost() {
        let registry = ServiceRegistry::new(false);
        registry
            .add_service(cfg("web", &["Web.Example"]))
            .await
            .expect("add");

        assert!(registry.get_service("web").await.is_some());
        // lookups are case-insensitive exact matches
        let by_vhost = registry.get_vhost_service("web.example").await.expect("vhost");
        assert_eq!(by_vhost.name, "web");
        assert!(registry.get_vhost_service("other.example").await.is_none());

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn duplicate_name_and_vhost_conflicts_fail() {
        let registry = ServiceRegistry::new(false);
        registry.add_service(cfg("web", &["a.example"])).await.expect("add");

        let err = registry.add_service(cfg("web", &[])).await.expect_err("dup name");
        assert!(matches!(err, RegistryError::ServiceExists(_)));

        let err = registry
            .add_service(cfg("other", &["a.example"]))
            .await
            .expect_err("claimed vhost");
        assert!(matches!(err, RegistryError::VHostTaken { .. }));
        assert!(
            registry.get_service("other").await.is_none(),
            "failed add leaves no trace"
        );

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn update_with_equal_config_is_a_noop() {
        let registry = ServiceRegistry::new(false);
        registry.add_service(cfg("web", &["a.example"])).await.expect("add");
        let before = registry.get_service("web").await.expect("service");

        // feed the running config straight back, listener must not flap
        for config in registry.config().await {
            registry.update_service(config).await.expect("noop update");
        }

        let after = registry.get_service("web").await.expect("service");
        assert!(Arc::ptr_eq(&before, &after), "service instance unchanged");

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn update_rewrites_vhost_index() {
        let registry = ServiceRegistry::new(false);
        registry.add_service(cfg("web", &["a.example"])).await.expect("add");

        registry
            .update_service(cfg("web", &["b.example"]))
            .await
            .expect("update");

        assert!(registry.get_vhost_service("a.example").await.is_none());
        let owner = registry.get_vhost_service("b.example").await.expect("vhost");
        assert_eq!(owner.name, "web");

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn update_carries_backend_health_state() {
        let mut config = cfg("web", &[]);
        config.backends = vec![BackendConfig {
            name: "b1".to_string(),
            addr: "127.0.0.1:1".to_string(),
            ..Default::default()
        }];

        let registry = ServiceRegistry::new(false);
        registry.add_service(config.clone()).await.expect("add");
        registry
            .get_service("web")
            .await
            .expect("service")
            .get_backend("b1")
            .expect("backend")
            .set_up(false);

        config.balance = "LC".to_string(); // force a real replacement
        registry.update_service(config).await.expect("update");

        let carried = registry
            .get_service("web")
            .await
            .expect("service")
            .get_backend("b1")
            .expect("backend");
        assert!(!carried.up(), "down state carried to the replacement");

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn remove_service_clears_both_indices() {
        let registry = ServiceRegistry::new(false);
        registry.add_service(cfg("web", &["a.example"])).await.expect("add");

        registry.remove_service("web").await.expect("remove");
        assert!(registry.get_service("web").await.is_none());
        assert!(registry.get_vhost_service("a.example").await.is_none());

        let err = registry.remove_service("web").await.expect_err("absent");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bind_failure_refuses_registration() {
        let registry = ServiceRegistry::new(false);
        let mut config = cfg("web", &[]);
        // TEST-NET address, not assigned to any local interface
        config.addr = "198.51.100.1:0".to_string();

        let err = registry.add_service(config).await.expect_err("bad addr");
        assert!(matches!(err, RegistryError::Bind(_)));
        assert!(registry.get_service("web").await.is_none());
    }
}
