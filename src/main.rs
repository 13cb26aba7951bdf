use clap::Parser;
use faasgate::admin::{AdminServer, PKG_NAME, VERSION};
use faasgate::config::{Config, Settings};
use faasgate::docker::{ContainerRuntime, DockerCli};
use faasgate::executor::Executor;
use faasgate::pool::PoolConfig;
use faasgate::proxy::{Gateway, GatewayServer};
use faasgate::reaper::Reaper;
use faasgate::route::RouteTable;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Function-as-a-service gateway
#[derive(Parser, Debug)]
#[command(name = PKG_NAME, version = VERSION, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "faasgate.toml")]
    config: PathBuf,

    /// Pull every route image before serving
    #[arg(long)]
    pull: bool,

    /// Pull every route image, then exit
    #[arg(long, conflicts_with = "pull")]
    pull_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("faasgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config).map_err(|e| {
        error!(path = %args.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %args.config.display(), "Configuration loaded");
    print_startup_banner(&config);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::from_config(&config.runtime));

    if args.pull || args.pull_only {
        pull_images(runtime.as_ref(), &config).await?;
        if args.pull_only {
            info!("Images pulled, exiting");
            return Ok(());
        }
    }

    std::fs::create_dir_all(&config.runtime.tmp_dir).map_err(|e| {
        anyhow::anyhow!(
            "Failed to create tmp directory '{}': {}",
            config.runtime.tmp_dir.display(),
            e
        )
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let table = Arc::new(RouteTable::from_config(&config.routes));
    let settings = Settings::from_config(&config).shared();
    let executor = Executor::new(runtime, config.runtime.tmp_dir.clone());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&table),
        Arc::clone(&settings),
        executor,
        pool_config,
    ));

    let gateway_addr = bind_address(&config.server.bind, config.server.port)?;
    let gateway_server = GatewayServer::new(gateway_addr, Arc::clone(&gateway), shutdown_rx.clone());
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_handle = if config.server.admin_enabled() {
        let admin_addr = bind_address(&config.server.bind, config.server.admin_port)?;
        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&gateway),
            shutdown_rx.clone(),
            config.server.authorization.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Management API disabled (no authorization configured)");
        None
    };

    // The reaper handle doubles as the drain wait-group
    let reaper = Reaper::new(table, settings, gateway.orchestrator().clone());
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the reaper to stop and remove every container
    match reaper_handle.await {
        Ok(summary) => info!(removed = summary.removed, failed = summary.failed, "Containers drained"),
        Err(e) => error!(error = %e, "Reaper task failed"),
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn bind_address(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e)
    })
}

/// Pull the image of every route, stopping at the first failure
async fn pull_images(runtime: &dyn ContainerRuntime, config: &Config) -> anyhow::Result<()> {
    let images: BTreeSet<&str> = config
        .routes
        .values()
        .filter_map(|route| route.image.as_deref())
        .filter(|image| !image.is_empty())
        .collect();

    for image in images {
        runtime
            .pull(image)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        prefix = %config.server.prefix,
        admin_port = if config.server.admin_enabled() { Some(config.server.admin_port) } else { None },
        "Server configuration"
    );
    info!(
        command = %config.runtime.command,
        label = %config.runtime.label,
        tmp_dir = %config.runtime.tmp_dir.display(),
        "Container runtime"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        reaper_delay_secs = config.reaper.delay_secs,
        "Connection pool and reaper settings"
    );

    let mut names: Vec<_> = config.routes.iter().collect();
    names.sort_by(|a, b| a.0.cmp(b.0));
    for (name, route) in names {
        info!(
            route = %name,
            kind = route.kind.as_str(),
            timeout_ms = route.timeout_ms,
            "Route configured"
        );
    }
}
