use bank_detail_extractor::config::AppConfig;
use bank_detail_extractor::services::gemini::GeminiClient;
use bank_detail_extractor::{AppState, create_app};
use dotenvy::dotenv;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing with EnvFilter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bank_detail_extractor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting Bank Detail Extractor...");

    let config = AppConfig::from_env();
    config.validate()?;
    info!(
        "⚙️  Config: Model={}, Poll Timeout={}s, Poll Interval={}ms, Max Size={}MB",
        config.model,
        config.poll_timeout_secs,
        config.poll_interval_ms,
        config.max_file_size / 1024 / 1024
    );
    if !config.has_api_key() {
        warn!("GEMINI_API_KEY is not set; extraction requests will be rejected upstream");
    }

    // One client for the whole process
    let gemini = Arc::new(GeminiClient::from_config(&config)?);
    let addr = config.bind_addr;
    let state = AppState::new(gemini, config);

    let app = create_app(state);

    info!("✅ Server ready at http://{}", addr);
    info!("📖 Swagger UI: http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, starting graceful shutdown...");
        },
    }
}
