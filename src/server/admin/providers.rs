use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{GatewayError, Result};
use crate::server::{AppState, auth};
use crate::store::keys::{ApiKeyCreate, ApiKeyUpdate};
use crate::store::providers::{ProviderCreate, ProviderUpdate};
use crate::upstream::{self, UpstreamConfig};

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let providers = state.store.list_providers().await?;
    Ok(Json(serde_json::to_value(providers)?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ProviderCreate>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    if req.api_key.is_empty() {
        return Err(GatewayError::InvalidPayload("缺少 api_key".into()));
    }
    let id = state.store.create_provider(&req).await?;
    tracing::info!("添加提供商 | {}", req.name);
    Ok(Json(json!({ "id": id, "name": req.name, "is_active": true })))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ProviderUpdate>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some((old_prefix, old_proxy)) = state.store.update_provider(id, &req).await? else {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    };

    // 前缀变更联动刷新该提供商下模型的显示名
    if let Some(new_prefix) = &req.model_prefix {
        if *new_prefix != old_prefix {
            let synced = state.store.sync_display_names_for_provider(id).await?;
            tracing::info!("同步前缀 | provider={} | {} -> {} | {}个模型", id, old_prefix, new_prefix, synced);
        }
    }

    // 代理配置可能已变，丢弃旧客户端；在途请求不受影响
    upstream::invalidate_client(&old_proxy);

    tracing::info!("更新提供商 | {}", id);
    Ok(Json(json!({ "message": "更新成功" })))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(proxy_url) = state.store.delete_provider(id).await? else {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    };
    upstream::invalidate_client(&proxy_url);
    tracing::info!("删除提供商 | {}", id);
    Ok(Json(json!({ "message": "删除成功" })))
}

/// 拉取上游 `/models` 并与本地模型表做三路同步
pub async fn fetch_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(provider) = state.store.get_provider(id).await? else {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    };

    let api_key = state.rotator.next_key(provider.id).await?;
    let cfg = UpstreamConfig::from_provider(&provider, api_key);

    let fetched = match upstream::list_models(&cfg).await {
        Ok(fetched) => fetched,
        Err(e) => {
            tracing::error!("拉取模型失败 | {} | {}", provider.name, e);
            return Err(GatewayError::Upstream(format!("拉取模型失败: {}", e)));
        }
    };

    let fetched_ids: Vec<String> = fetched
        .iter()
        .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .collect();

    let (added, updated, deleted) = state
        .store
        .sync_fetched_models(id, &provider.model_prefix, &fetched_ids)
        .await?;

    let mut messages = Vec::new();
    if added > 0 {
        messages.push(format!("添加 {} 个新模型", added));
    }
    if updated > 0 {
        messages.push(format!("更新 {} 个模型", updated));
    }
    if deleted > 0 {
        messages.push(format!("删除 {} 个已下线模型", deleted));
    }
    if messages.is_empty() {
        messages.push("没有变化".to_string());
    }

    tracing::info!("拉取模型 | {} | {:?}", provider.name, messages);
    Ok(Json(json!({
        "message": messages.join("、"),
        "total_fetched": fetched_ids.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct AddModelRequest {
    pub model_id: String,
}

pub async fn add_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<AddModelRequest>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(provider) = state.store.get_provider(id).await? else {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    };
    if state.store.model_exists(id, &req.model_id).await? {
        return Err(GatewayError::InvalidPayload("模型已存在".into()));
    }

    let display_name = if provider.model_prefix.is_empty() {
        req.model_id.clone()
    } else {
        format!("{}/{}", provider.model_prefix, req.model_id)
    };
    state.store.add_model(id, &req.model_id, &display_name, true).await?;
    tracing::info!("手动添加模型 | {} | {}", provider.name, req.model_id);
    Ok(Json(json!({ "message": "添加成功" })))
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let models = state.store.list_provider_models(id).await?;
    Ok(Json(serde_json::to_value(models)?))
}

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    if state.store.get_provider(id).await?.is_none() {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    }
    let keys = state.store.list_provider_keys(id).await?;
    Ok(Json(serde_json::to_value(keys)?))
}

pub async fn add_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ApiKeyCreate>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    let Some(provider) = state.store.get_provider(id).await? else {
        return Err(GatewayError::NotFound("提供商不存在".into()));
    };
    let (key_id, name) = state.store.add_provider_key(id, &req).await?;
    tracing::info!("添加密钥 | {} | {}", provider.name, name);
    Ok(Json(json!({
        "id": key_id,
        "provider_id": id,
        "name": name,
        "is_active": true,
    })))
}

pub async fn update_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((_, key_id)): Path<(i64, i64)>,
    Json(req): Json<ApiKeyUpdate>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state.store.update_provider_key(key_id, &req).await?;
    Ok(Json(json!({ "message": "更新成功" })))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((_, key_id)): Path<(i64, i64)>,
) -> Result<Json<Value>> {
    auth::require_admin(&state, &headers).await?;
    state.store.delete_provider_key(key_id).await?;
    Ok(Json(json!({ "message": "删除成功" })))
}
