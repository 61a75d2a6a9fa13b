use anyhow::Result;
use std::sync::Arc;

use album_gateway::auth::{SqliteStore, TokenManager};
use album_gateway::config::{self, Config};
use album_gateway::http_client::PhotosClient;
use album_gateway::routes::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Album Gateway starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Open the credential store
    let store = Arc::new(SqliteStore::open(&config.db_file)?);

    // Initialize token manager (loads any persisted session)
    tracing::info!("Initializing authentication...");
    let tokens = Arc::new(TokenManager::new(
        config.oauth.clone(),
        store,
        &config.auth,
    )?);

    let status = tokens.session_status().await;
    if status.authenticated {
        tracing::info!("Existing session is valid");
    } else if status.renewable {
        tracing::info!("Existing session will be renewed on first request");
    } else {
        tracing::warn!(
            "No session yet, sign in at http://{}:{}/auth/login",
            config.server_host,
            config.server_port
        );
    }

    let photos = Arc::new(PhotosClient::new(tokens.clone(), config.api_base.clone()));
    let app = routes::build_app(AppState::new(tokens, photos));

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);

    // Start server with graceful shutdown
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &config::Config) {
    println!();
    println!("  Album Gateway {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Callback:    {}", config.oauth.redirect_uri);
    println!("  Scopes:      {}", config.oauth.scopes.len());
    println!("  API base:    {}", config.api_base);
    println!("  Auth store:  {}", config.db_file.display());
    println!("  Renew skew:  {}s", config.auth.renewal_skew_secs);
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
