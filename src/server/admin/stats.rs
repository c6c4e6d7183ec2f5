use std::sync::Arc;

use axum::http::HeaderMap;
use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::error::Result;
use crate::server::{AppState, auth};
use crate::store::time;

/// 当前周期（北京时间 15:00 滚动）的用量总览
pub async fn period_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let stats = state.store.period_stats().await?;

    let now = time::beijing_now();
    let next_reset = time::next_reset_after(now);
    Ok(Json(json!({
        "total_tokens": stats.total_tokens,
        "prompt_tokens": stats.prompt_tokens,
        "completion_tokens": stats.completion_tokens,
        "hourly_stats": stats.hourly_stats,
        "model_stats": stats.model_stats,
        "server_time": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "next_reset_time": next_reset.format("%Y-%m-%d %H:%M:%S").to_string(),
        "timezone": "Asia/Shanghai (UTC+8)",
    })))
}

pub async fn reset_period(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let deleted = state.store.reset_current_period().await?;
    tracing::info!(deleted, "手动重置当前周期统计");
    Ok(Json(json!({ "message": "当前周期统计已重置" })))
}
