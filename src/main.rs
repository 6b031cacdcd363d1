use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal;

use hublot::web_interface::routes::AppState;
use hublot::{Config, DockerRuntime, EgressSupervisor, MetadataStore, SessionManager, WebServer};

#[derive(Parser)]
#[command(name = "hublot")]
#[command(version)]
#[command(about = "Browser-to-container terminal broker")]
struct Args {
    /// Override the listen port (SERVER_PORT otherwise)
    #[arg(long)]
    port: Option<u16>,
    /// Override the SQLite database path (DATABASE_PATH otherwise)
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("sea_orm", log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .format_target(false)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    println!(
        "
    ██╗  ██╗██╗   ██╗██████╗ ██╗      ██████╗ ████████╗
    ██║  ██║██║   ██║██╔══██╗██║     ██╔═══██╗╚══██╔══╝
    ███████║██║   ██║██████╔╝██║     ██║   ██║   ██║
    ██╔══██║██║   ██║██╔══██╗██║     ██║   ██║   ██║
    ██║  ██║╚██████╔╝██████╔╝███████╗╚██████╔╝   ██║
    ╚═╝  ╚═╝ ╚═════╝ ╚═════╝ ╚══════╝ ╚═════╝    ╚═╝
    ====================================================
        Browser-to-container terminal broker v{}
    ====================================================
    ",
        env!("CARGO_PKG_VERSION")
    );

    info!("Hublot starting on {}:{}", config.host, config.port);

    let store = match MetadataStore::connect(&config.database_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                "Failed to open metadata store {}: {}",
                config.database_path, e
            );
            std::process::exit(1);
        }
    };

    let runtime = match DockerRuntime::connect().await {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!("Failed to connect to the container runtime: {}", e);
            std::process::exit(1);
        }
    };

    let anonymity = Arc::new(EgressSupervisor::new(config.socks_port, store.clone()));

    let sessions = Arc::new(SessionManager::new(
        runtime,
        store.clone(),
        anonymity.clone(),
        config.clone(),
    ));

    // Reconcile sessions stranded by a previous process before serving.
    match sessions.recover().await {
        Ok(0) => {}
        Ok(count) => info!("Reconciled {} stranded sessions", count),
        Err(e) => error!("Session recovery failed: {}", e),
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let sweeper = tokio::spawn(
        sessions
            .clone()
            .run_sweeper(shutdown_tx.subscribe()),
    );

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid listen address {}:{}: {}", config.host, config.port, e);
            std::process::exit(1);
        }
    };

    let state = AppState {
        sessions: sessions.clone(),
        store,
        anonymity: anonymity.clone(),
        config: Arc::new(config),
    };
    let server = WebServer::new(state);
    let server_shutdown = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        server.start(addr, server_shutdown).await;
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    // Close bound bridges, stop the proxy, then stop the listener and
    // sweeper. Containers are left to crash recovery on next start.
    sessions.shutdown().await;
    if anonymity.is_enabled() {
        if let Err(e) = anonymity.disable().await {
            warn!("Failed to stop egress proxy: {}", e);
        }
    }
    let _ = shutdown_tx.send(());

    for (name, handle) in [("server", server_handle), ("sweeper", sweeper)] {
        match tokio::time::timeout(std::time::Duration::from_secs(10), handle).await {
            Ok(Ok(())) => info!("{} stopped", name),
            Ok(Err(e)) => error!("{} task failed during shutdown: {}", name, e),
            Err(_) => warn!("{} shutdown timed out", name),
        }
    }

    info!("Hublot stopped");
}
