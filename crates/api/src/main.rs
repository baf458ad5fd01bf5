use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_events::EventBus;
use relay_goofish::api::HttpTokenSource;
use relay_goofish::transport::WsConnector;
use relay_goofish::ClientManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::accounts::load_accounts_file;
use relay_api::config::ServerConfig;
use relay_api::push::DashboardPush;
use relay_api::router::build_app_router;
use relay_api::state::AppState;
use relay_api::ws;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_api=debug,relay_goofish=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().expect("Invalid server configuration");
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::new(config.event_channel_capacity));

    // --- Client manager ---
    let clients = ClientManager::new(
        config.connection.clone(),
        Arc::new(WsConnector::new(config.connection.ws_url.clone())),
        Arc::new(HttpTokenSource::new(&config.connection)),
        Arc::clone(&event_bus),
    );

    // --- Dashboard push ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));
    let push_handle = clients.attach_sink(Arc::new(DashboardPush::new(Arc::clone(&ws_manager))));

    // --- Startup accounts ---
    if let Some(path) = &config.accounts_file {
        match load_accounts_file(path) {
            Ok(credentials) => {
                tracing::info!(count = credentials.len(), path = %path.display(), "Registering accounts from file");
                for credential in credentials {
                    let account_id = credential.account_id.clone();
                    if let Err(e) = clients.register(credential).await {
                        tracing::error!(account_id = %account_id, error = %e, "Failed to register account");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to load accounts file"),
        }
    }

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        clients: Arc::clone(&clients),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    clients.shutdown().await;

    // The push task ends once the last bus handle is gone.
    drop(clients);
    drop(event_bus);
    let _ = tokio::time::timeout(Duration::from_secs(5), push_handle).await;

    ws_manager.shutdown_all().await;
    heartbeat_handle.abort();

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
