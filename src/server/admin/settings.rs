use std::sync::Arc;

use axum::http::HeaderMap;
use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{GatewayError, Result};
use crate::server::{AppState, auth};
use crate::store::settings::{CustomErrorRule, CustomRateLimitRule, StreamMode};

pub async fn get_stream_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let mode = state.store.stream_mode().await?;
    Ok(Json(json!({ "mode": mode.as_db_value() })))
}

#[derive(Debug, Deserialize)]
pub struct StreamModeRequest {
    pub mode: String,
}

pub async fn set_stream_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StreamModeRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(mode) = StreamMode::parse(&req.mode) else {
        return Err(GatewayError::InvalidPayload("无效的模式".into()));
    };
    state.store.set_setting("stream_mode", mode.as_db_value()).await?;
    tracing::info!("更新流式模式 | {}", mode.as_db_value());
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_retry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let max_retries = state.store.max_retries().await?;
    Ok(Json(json!({ "max_retries": max_retries })))
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub max_retries: i64,
}

pub async fn set_retry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RetryRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    if !(0..=10).contains(&req.max_retries) {
        return Err(GatewayError::InvalidPayload("重试次数必须在 0-10 之间".into()));
    }
    state
        .store
        .set_setting("max_retries", &req.max_retries.to_string())
        .await?;
    tracing::info!("更新重试次数 | {}", req.max_retries);
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_system_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let prompt = state.store.get_setting("system_prompt").await?.unwrap_or_default();
    let enabled = state.store.get_setting("system_prompt_enabled").await?.as_deref()
        == Some("true");
    Ok(Json(json!({ "prompt": prompt, "enabled": enabled })))
}

#[derive(Debug, Deserialize)]
pub struct SystemPromptRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub enabled: bool,
}

pub async fn set_system_prompt(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SystemPromptRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state.store.set_setting("system_prompt", &req.prompt).await?;
    state
        .store
        .set_setting("system_prompt_enabled", if req.enabled { "true" } else { "false" })
        .await?;
    tracing::info!("更新系统提示词 | 启用={} 长度={}", req.enabled, req.prompt.len());
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_rate_limit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let cfg = state.store.rate_limit_config().await?;
    Ok(Json(json!({
        "enabled": cfg.enabled,
        "max_requests": cfg.max_requests,
        "window": cfg.window_seconds,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RateLimitRequest {
    #[serde(default)]
    pub enabled: bool,
    pub max_requests: i64,
    pub window: i64,
}

pub async fn set_rate_limit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RateLimitRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state
        .store
        .set_setting("rate_limit_enabled", if req.enabled { "true" } else { "false" })
        .await?;
    state
        .store
        .set_setting("rate_limit_max_requests", &req.max_requests.to_string())
        .await?;
    state
        .store
        .set_setting("rate_limit_window", &req.window.to_string())
        .await?;
    tracing::info!(
        "更新速率限制 | 启用={} 最大请求={} 窗口={}s",
        req.enabled, req.max_requests, req.window
    );
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_concurrency(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let cfg = state.store.concurrency_config().await?;
    let (started, succeeded, failed) = state.stats.snapshot();
    Ok(Json(json!({
        "enabled": cfg.enabled,
        "limit": if cfg.limit > 0 { cfg.limit } else { 10 },
        "current": state.limits.current_in_flight(),
        "requests": { "started": started, "succeeded": succeeded, "failed": failed },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    #[serde(default)]
    pub enabled: bool,
    pub limit: i64,
}

pub async fn set_concurrency(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ConcurrencyRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state
        .store
        .set_setting("concurrency_enabled", if req.enabled { "true" } else { "false" })
        .await?;
    state
        .store
        .set_setting("concurrency_limit", &req.limit.to_string())
        .await?;
    tracing::info!("更新并发限制 | 启用={} 限制={}", req.enabled, req.limit);
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_custom_rate_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let rules = state.store.custom_rate_limit_rules().await?;

    // 补充提供商名称方便展示
    let providers = state.store.list_providers().await?;
    let rules: Vec<Value> = rules
        .iter()
        .map(|rule| {
            let provider_name = providers
                .iter()
                .find(|p| p.id == rule.provider_id)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            json!({
                "id": rule.id,
                "name": rule.name,
                "provider_id": rule.provider_id,
                "provider_name": provider_name,
                "model_name": rule.model_name,
                "max_requests": rule.max_requests,
                "window": rule.window,
                "enabled": rule.enabled,
            })
        })
        .collect();
    Ok(Json(json!({ "rules": rules })))
}

#[derive(Debug, Deserialize)]
pub struct CustomRateLimitsRequest {
    pub rules: Vec<CustomRateLimitRule>,
}

pub async fn set_custom_rate_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CustomRateLimitsRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state.store.set_custom_rate_limit_rules(&req.rules).await?;
    tracing::info!("更新自定义速率限制规则 | {}条规则", req.rules.len());
    Ok(Json(json!({ "message": "设置已更新" })))
}

pub async fn get_custom_error(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let enabled = state.store.get_setting("custom_error_enabled").await?.as_deref()
        == Some("true");
    let rules: Vec<CustomErrorRule> = state
        .store
        .get_setting("custom_error_rules")
        .await?
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    Ok(Json(json!({ "enabled": enabled, "rules": rules })))
}

#[derive(Debug, Deserialize)]
pub struct CustomErrorRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<CustomErrorRule>,
}

pub async fn set_custom_error(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CustomErrorRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state.store.set_custom_error_rules(req.enabled, &req.rules).await?;
    tracing::info!(
        "更新自定义错误响应 | 启用={} 规则数={}",
        req.enabled, req.rules.len()
    );
    Ok(Json(json!({ "message": "设置已更新" })))
}
