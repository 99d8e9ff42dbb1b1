use tokio::net::TcpListener;
use tracing::info;

use reelgrab::config::Config;
use reelgrab::error::ApiError;
use reelgrab::server::{self, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "reelgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();
    let state = AppState::new(&config).await?;

    server::sweep_stale_jobs(&config.download_dir, server::STALE_JOB_AGE).await;

    let app = server::router(state);
    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("could not bind {}: {error}", config.bind_addr))
    })?;

    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
