use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use webspace_gate::balancer::Balancer;
use webspace_gate::config::Config;
use webspace_gate::dispatch::{Destination, Server, DEFAULT_WEIGHT};
use webspace_gate::pool::{ConnectionPool, PoolConfig};
use webspace_gate::proxy::{HttpServer, RequestRouter};
use webspace_gate::stream::{StreamRouter, TcpServer};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("webspace_gate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let identity = config.webspace.identity();
    let gate_options = config.webspace.gate_options();

    let http_handle = if config.server.http_port > 0 {
        let http_addr = bind_addr(&config.server.bind, config.server.http_port)?;

        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: config.server.pool_idle_timeout(),
        }));

        let seeds = config
            .server
            .seed_backends
            .iter()
            .map(|url| Destination::parse_url(url).map(|d| Server::new(d, DEFAULT_WEIGHT)))
            .collect::<Result<Vec<_>, _>>()?;

        let balancer = Arc::new(
            Balancer::new("webspace", pool, config.server.request_timeout())
                .with_lock_timeout(config.webspace.dispatch_lock_timeout())
                .with_servers(seeds),
        );

        let router = Arc::new(RequestRouter::new(identity.clone(), balancer, gate_options.clone())?);
        let server = HttpServer::new(http_addr, router, shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP gateway error");
            }
        }))
    } else {
        None
    };

    let tcp_handle = if config.server.tcp_port > 0 {
        let tcp_addr = bind_addr(&config.server.bind, config.server.tcp_port)?;

        let router = Arc::new(
            StreamRouter::new(identity, gate_options)?.with_dial_timeout(config.webspace.dial_timeout()),
        );
        let server = TcpServer::new(tcp_addr, router, shutdown_rx.clone());

        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "TCP gateway error");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = tcp_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn bind_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting webspace gate");
    info!(
        bind = %config.server.bind,
        http_port = if config.server.http_port > 0 { Some(config.server.http_port) } else { None },
        tcp_port = if config.server.tcp_port > 0 { Some(config.server.tcp_port) } else { None },
        seed_backends = ?config.server.seed_backends,
        "Server configuration"
    );
    info!(
        url = %config.webspace.url,
        user_id = config.webspace.user_id,
        request_timeout_secs = config.webspace.request_timeout_secs,
        boot_timeout_secs = config.webspace.boot_timeout_secs,
        cache_ttl_secs = config.webspace.cache_ttl_secs,
        "Webspace control plane"
    );
}
