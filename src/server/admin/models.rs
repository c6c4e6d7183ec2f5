use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{GatewayError, Result};
use crate::server::{AppState, auth};

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let models = state.store.list_all_models().await?;
    Ok(Json(serde_json::to_value(models)?))
}

#[derive(Debug, Deserialize)]
pub struct ModelUpdateRequest {
    pub display_name: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ModelUpdateRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;

    let mut touched = false;
    if let Some(display_name) = req.display_name.as_deref().filter(|n| !n.is_empty()) {
        touched |= state.store.set_model_display_name(id, display_name).await?;
        tracing::info!("修改模型名称 | {} -> {}", id, display_name);
    }
    if let Some(is_active) = req.is_active {
        touched |= state.store.set_model_active(id, is_active).await?;
        tracing::info!("{}模型 | {}", if is_active { "启用" } else { "禁用" }, id);
    }
    if !touched {
        return Err(GatewayError::NotFound("模型不存在".into()));
    }
    Ok(Json(json!({ "message": "更新成功" })))
}

pub async fn reset_name(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(display_name) = state.store.reset_model_display_name(id).await? else {
        return Err(GatewayError::NotFound("模型不存在".into()));
    };
    tracing::info!("重置模型名称 | {}", display_name);
    Ok(Json(json!({ "message": "重置成功", "display_name": display_name })))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    if !state.store.delete_model(id).await? {
        return Err(GatewayError::NotFound("模型不存在".into()));
    }
    tracing::info!("删除模型 | {}", id);
    Ok(Json(json!({ "message": "删除成功" })))
}

#[derive(Debug, Deserialize)]
pub struct BatchToggleRequest {
    pub model_ids: Vec<i64>,
    pub is_active: bool,
}

pub async fn batch_toggle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BatchToggleRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    if req.model_ids.is_empty() {
        return Err(GatewayError::InvalidPayload("没有选择模型".into()));
    }
    let updated = state.store.set_models_active(&req.model_ids, req.is_active).await?;
    tracing::info!(
        "批量{}模型 | {}个",
        if req.is_active { "启用" } else { "禁用" },
        updated
    );
    Ok(Json(json!({ "message": format!("已更新 {} 个模型", updated) })))
}
