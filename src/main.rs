use shuttle::admin::AdminServer;
use shuttle::config::Config;
use shuttle::registry::ServiceRegistry;
use shuttle::router::HostRouter;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shuttle=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = ServiceRegistry::new(config.server.ssl_only);

    for service_cfg in config.services.clone() {
        let name = service_cfg.name.clone();
        if let Err(e) = registry.add_service(service_cfg).await {
            error!(service = %name, error = %e, "failed to start configured service");
        }
    }

    let router = HostRouter::bind(
        &config.server.http_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
    )
    .await?;

    let reserved_ports = [&config.server.http_addr, &config.server.admin_addr]
        .iter()
        .filter_map(|addr| addr.rsplit_once(':').map(|(_, port)| port.to_string()))
        .collect();
    let admin = AdminServer::bind(
        &config.server.admin_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        reserved_ports,
    )
    .await?;

    let router_handle = tokio::spawn(router.run());
    let admin_handle = tokio::spawn(admin.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    registry.stop_all().await;
    let _ = router_handle.await;
    let _ = admin_handle.await;
    Ok(())
}
