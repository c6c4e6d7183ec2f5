mod config;
mod custom_error;
mod error;
mod limits;
mod routing;
mod scheduler;
mod server;
mod shape;
mod stats;
mod store;
mod tokenizer;
mod upstream;

use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> crate::error::Result<()> {
    // Local development: load `.env` without panicking (no-op if missing).
    dotenvy::dotenv().ok();

    // 使用北京时间格式与环境过滤器
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(crate::store::time::BeijingTimer)
        .init();

    let config = config::Settings::load();

    let addr = config.addr();
    let app = server::create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gateway server running on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
