mod account;
mod models;
mod providers;
mod settings;
mod stats;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};

use super::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/login", post(account::login))
        .route("/api/auth/me", get(account::me))
        .route(
            "/api/settings/stream-mode",
            get(settings::get_stream_mode).put(settings::set_stream_mode),
        )
        .route(
            "/api/settings/retry",
            get(settings::get_retry).put(settings::set_retry),
        )
        .route(
            "/api/settings/system-prompt",
            get(settings::get_system_prompt).put(settings::set_system_prompt),
        )
        .route(
            "/api/settings/rate-limit",
            get(settings::get_rate_limit).put(settings::set_rate_limit),
        )
        .route(
            "/api/settings/concurrency",
            get(settings::get_concurrency).put(settings::set_concurrency),
        )
        .route(
            "/api/settings/custom-rate-limits",
            get(settings::get_custom_rate_limits).put(settings::set_custom_rate_limits),
        )
        .route(
            "/api/settings/custom-error",
            get(settings::get_custom_error).put(settings::set_custom_error),
        )
        .route(
            "/api/providers",
            get(providers::list).post(providers::create),
        )
        .route(
            "/api/providers/{id}",
            put(providers::update).delete(providers::delete),
        )
        .route("/api/providers/{id}/fetch-models", post(providers::fetch_models))
        .route("/api/providers/{id}/add-model", post(providers::add_model))
        .route("/api/providers/{id}/models", get(providers::list_models))
        .route(
            "/api/providers/{id}/api-keys",
            get(providers::list_keys).post(providers::add_key),
        )
        .route(
            "/api/providers/{id}/api-keys/{key_id}",
            put(providers::update_key).delete(providers::delete_key),
        )
        .route("/api/models", get(models::list))
        .route(
            "/api/models/{id}",
            put(models::update).delete(models::delete),
        )
        .route("/api/models/{id}/reset-name", post(models::reset_name))
        .route("/api/models/batch-toggle", post(models::batch_toggle))
        .route(
            "/api/tokens/stats",
            get(stats::period_stats).delete(stats::reset_period),
        )
}
