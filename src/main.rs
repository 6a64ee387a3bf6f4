use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::{Config, ProjectsFile};
use tenantgate::context::RuntimeContext;
use tenantgate::manager::ProjectManager;
use tenantgate::proxy::ProxyServer;
use tenantgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tenantgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Working copies from a previous run are never reused
    reset_workspace(&config.server.workspace_dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = ProjectManager::new(&config.server, RuntimeContext::from_config(&config));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(bind_addr, Arc::clone(&manager), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Router error");
        }
    });

    // Never hold requests forever if loading stalls
    let load_timeout = config.server.load_timeout();
    let fallback_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        tokio::time::sleep(load_timeout).await;
        if !fallback_manager.is_loaded() {
            warn!(timeout_secs = load_timeout.as_secs(), "Project loading timed out, releasing held requests");
            fallback_manager.set_loaded(true);
        }
    });

    // Inline projects first; a projects file finishes the load
    let projects_file = config.server.projects_file.clone();
    if let Err(e) = manager.add_projects(config.projects.clone(), projects_file.is_none()) {
        error!(error = %e, "Some inline projects could not be registered");
    }

    if let Some(path) = projects_file {
        let loader_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            match ProjectsFile::load(&path).await {
                Ok(projects) => {
                    info!(path = %path.display(), projects = projects.len(), "Projects file loaded");
                    if let Err(e) = loader_manager.add_projects(projects, true) {
                        error!(error = %e, "Some projects could not be registered");
                    }
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to load projects file");
                    loader_manager.set_loaded(true);
                }
            }
        });
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

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
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting connections
    let _ = shutdown_tx.send(true);

    info!("Stopping all microservices...");
    manager.stop_all().await;

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Empty the working-copy root, creating it if needed
fn reset_workspace(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => info!(dir = %dir.display(), "Cleared workspace"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to clear workspace '{}': {}", dir.display(), e));
        }
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("Failed to create workspace '{}': {}", dir.display(), e))?;
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        base_domain = %config.server.base_domain,
        subdomain = ?config.server.subdomain,
        halt_while_loading = config.server.halt_while_loading,
        load_timeout_secs = config.server.load_timeout_secs,
        "Server configuration"
    );
    info!(
        projects_dir = %config.server.projects_dir.display(),
        workspace_dir = %config.server.workspace_dir.display(),
        projects_file = ?config.server.projects_file,
        "Project sources"
    );
    info!(
        idle_timeout_secs = config.defaults.idle_timeout_secs,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        request_timeout_secs = config.defaults.request_timeout_secs,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Microservice defaults"
    );
    info!(
        port_range_start = config.defaults.port_range_start,
        port_range_end = config.defaults.port_range_end,
        pool_max_idle = config.defaults.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.defaults.pool_idle_timeout_secs,
        "Backend settings"
    );
    info!(
        project_count = config.projects.len(),
        projects = ?config.projects.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        "Inline projects"
    );
}
