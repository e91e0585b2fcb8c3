use flowgate::access::AccessPolicyStore;
use flowgate::admin::{AdminServer, PKG_NAME, VERSION};
use flowgate::config::Config;
use flowgate::pool::PoolConfig;
use flowgate::process::ProcessSupervisor;
use flowgate::proxy::ProxyServer;
use flowgate::runtime::RuntimeInstaller;
use flowgate::secrets::FileKeyProvider;
use flowgate::watchdog;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("flowgate.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let paths = config.paths.clone();
    let data_dir = paths.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let access = Arc::new(AccessPolicyStore::open(paths.access_db())?);
    let key_provider = Arc::new(FileKeyProvider::new(paths.secret_file()));

    let staging_dir = config
        .runtime
        .staging_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("staging"));
    let installer = Arc::new(RuntimeInstaller::new(
        config.runtime.clone(),
        paths.runtime_dir(),
        staging_dir,
        config.supervisor.entry_executable.clone(),
    )?);

    let (watchdog_handle, watchdog_service) = watchdog::channel(config.watchdog.clone());
    let watchdog_handle = Arc::new(watchdog_handle);

    let supervisor = ProcessSupervisor::new(
        config.supervisor.clone(),
        config.backend.clone(),
        &paths,
        key_provider,
        watchdog_handle.clone(),
        installer,
        shutdown_rx.clone(),
    )?;

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy = ProxyServer::with_pool_config(
        config.server.proxy_addr()?,
        config.backend.addr(),
        Arc::clone(&access),
        watchdog_handle,
        shutdown_rx.clone(),
        pool_config,
    )
    .with_request_timeout(config.server.request_timeout());
    let pool = Arc::clone(proxy.pool());

    // Generate admin token if not configured
    let admin_token = config
        .server
        .admin_token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if config.server.admin_token.is_none() {
        info!(token = %admin_token, "Generated admin API token");
    }

    let admin = AdminServer::new(
        config.server.admin_addr(),
        Arc::clone(&supervisor),
        Arc::clone(&access),
        pool,
        shutdown_rx.clone(),
        admin_token,
    );

    let watchdog_task = tokio::spawn(watchdog_service.run(Arc::clone(&supervisor), shutdown_rx.clone()));

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Bring the backend up in the background; it may need to download its runtime first
    let startup = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let state = supervisor.start().await;
            info!(state = state.as_str(), "Initial server start finished");
        })
    };

    // Wait for shutdown signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // An interrupted start may still be unwinding; stop() takes over from there
    let _ = tokio::time::timeout(Duration::from_secs(2), startup).await;

    info!("Stopping server...");
    supervisor.stop().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        let _ = watchdog_task.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        backend = %config.backend.addr(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        runtime_dir = %config.paths.runtime_dir().display(),
        data_dir = %config.paths.data_dir().display(),
        entry = %config.supervisor.entry_executable,
        "Backend runtime"
    );
}
