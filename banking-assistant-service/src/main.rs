use banking_assistant_service::{LogFormat, ServiceConfig, create_app};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing in the configured format
fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "banking_assistant_service=debug,banking_flow=debug,tower_http=debug".into()
    });

    match format {
        LogFormat::Pretty => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    init_tracing(config.log_format);
    info!(config = ?config, "Configuration loaded");

    let app = create_app(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let addr = listener.local_addr()?;

    info!("Banking assistant listening on {}", addr);
    info!("Telegram webhook: POST http://{}/telegram/webhook", addr);
    info!("Chat endpoint: POST http://{}/chat", addr);
    info!("Metrics: GET http://{}/metrics", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
