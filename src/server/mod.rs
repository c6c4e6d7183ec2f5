pub mod admin;
pub mod auth;
pub mod openai;
pub(crate) mod stream;
pub(crate) mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde_json::json;

use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::limits::Limits;
use crate::routing::KeyRotator;
use crate::stats::RequestStats;
use crate::store::Store;

pub struct AppState {
    pub config: Settings,
    pub store: Store,
    pub rotator: KeyRotator,
    pub limits: Limits,
    pub stats: RequestStats,
    pub secret_key: String,
}

pub async fn create_app(config: Settings) -> AppResult<Router> {
    let store = Store::open(&config.database_path).await?;

    let force_password = !config.admin_password.is_empty() && config.admin_password != "admin123";
    store
        .ensure_admin(&config.admin_username, &config.admin_password, force_password)
        .await?;

    let secret_key = if config.secret_key.is_empty() {
        let key = store.get_or_create_secret_key().await?;
        tracing::info!("Using persisted secret key from database");
        key
    } else {
        config.secret_key.clone()
    };

    crate::scheduler::spawn_retention_task(store.clone());

    let app_state = Arc::new(AppState {
        rotator: KeyRotator::new(store.clone()),
        limits: Limits::new(store.clone()),
        stats: RequestStats::default(),
        store,
        config,
        secret_key,
    });

    Ok(routes().with_state(app_state))
}

fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/chat/completions/ws", get(ws::chat_completions_ws))
        .merge(admin::routes())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}
