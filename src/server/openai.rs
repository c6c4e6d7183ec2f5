use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode, header};
use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::{Value, json};

use crate::custom_error::{fake_completion, fake_stream_body, match_custom_response};
use crate::error::{GatewayError, Result};
use crate::shape;
use crate::tokenizer;
use crate::upstream::{self, UpstreamConfig};

use super::{AppState, auth, stream};

/// `GET /v1/models`：启用的模型 × 启用的提供商。
/// 对外 id 用 display_name，缺省回落 original_id；owned_by 为提供商名。
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    auth::require_api_user(&state, &headers).await?;

    let models = state.store.list_active_models().await?;
    let created = Utc::now().timestamp();
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m.visible_id(),
                "object": "model",
                "created": created,
                "owned_by": if m.provider_name.is_empty() { "unknown" } else { m.provider_name.as_str() },
            })
        })
        .collect();

    Ok(Json(json!({ "object": "list", "data": data })))
}

/// 终端错误先过自定义响应规则：命中则伪装成 200 的正常回复
async fn rewrite_or(
    state: &AppState,
    err: GatewayError,
    is_stream: bool,
    model: &str,
    reason: &str,
) -> Response {
    if let Some(custom) = match_custom_response(&state.store, &err.to_string()).await {
        tracing::error!("{} | 自定义响应(原错误: {})", model, reason);
        return synthetic_response(&custom, model, is_stream);
    }
    err.into_response()
}

fn synthetic_response(content: &str, model: &str, is_stream: bool) -> Response {
    if is_stream {
        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            fake_stream_body(content, model),
        )
            .into_response()
    } else {
        (StatusCode::OK, Json(fake_completion(content, model))).into_response()
    }
}

/// `POST /v1/chat/completions` 调度主流程：
/// 鉴权 → 全局限流 → 并发闸门 → 整形 → 模型解析 → 规则限流 →
/// 密钥轮询 → 上游调用（流式透传或一次性转发）→ 用量落账
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut payload): Json<Value>,
) -> Response {
    if let Err(e) = auth::require_api_user(&state, &headers).await {
        return e.into_response();
    }

    let Some(model_name) = payload
        .get("model")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .filter(|m| !m.is_empty())
    else {
        return GatewayError::InvalidPayload("缺少 model 参数".into()).into_response();
    };
    let mut is_stream = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    if let Err(e) = state.limits.check_global().await {
        return rewrite_or(&state, e, is_stream, &model_name, "全局速率限制").await;
    }

    let permit = match state.limits.acquire().await {
        Ok(permit) => permit,
        Err(e) => return rewrite_or(&state, e, is_stream, &model_name, "并发限制").await,
    };

    let start = Instant::now();

    // 流式开关覆盖与 usage 注入在出站前完成；配置读取失败按 auto 处理
    let mode = state.store.stream_mode().await.unwrap_or_default();
    is_stream = shape::apply_stream_mode(&mut payload, mode);
    if is_stream {
        shape::ensure_include_usage(&mut payload);
    }
    if let Ok(Some(prompt)) = state.store.system_prompt().await {
        shape::inject_system_prompt(&mut payload, &prompt);
    }

    let resolved = match state.store.resolve_model(&model_name).await {
        Ok(resolved) => resolved,
        Err(e) => return rewrite_or(&state, e, is_stream, &model_name, "查询模型失败").await,
    };
    let Some((model, provider)) = resolved else {
        let err = GatewayError::NotFound(format!("模型不存在: {}", model_name));
        return rewrite_or(&state, err, is_stream, &model_name, "模型不存在").await;
    };
    if !provider.is_active {
        let err = GatewayError::ProviderUnavailable(format!("提供商已禁用: {}", provider.name));
        return rewrite_or(&state, err, is_stream, &model_name, "提供商禁用").await;
    }

    let display_name = if model.display_name.is_empty() {
        model_name.clone()
    } else {
        model.display_name.clone()
    };

    if let Err(e) = state.limits.check_custom(provider.id, &display_name).await {
        let reason = match &e {
            GatewayError::CustomRateLimited(name) => format!("自定义速率限制 {}", name),
            _ => "自定义速率限制".to_string(),
        };
        return rewrite_or(&state, e, is_stream, &model_name, &reason).await;
    }

    let api_key = match state.rotator.next_key(provider.id).await {
        Ok(key) => key,
        Err(e) => return rewrite_or(&state, e, is_stream, &model_name, "无可用密钥").await,
    };

    shape::rewrite_model(&mut payload, &model.original_id, provider.provider_type);
    let cfg = UpstreamConfig::from_provider(&provider, api_key);

    let max_retries = state.store.max_retries().await.unwrap_or(3);
    state.stats.request_start();

    if is_stream {
        stream_chat(
            state, cfg, payload, model_name, display_name, provider.name, permit, start,
            max_retries,
        )
        .await
    } else {
        // 非流式路径持有 permit 到响应构造完成
        let response = non_stream_chat(
            &state, &cfg, &payload, &model_name, &display_name, &provider.name, start,
            max_retries,
        )
        .await;
        drop(permit);
        response
    }
}

#[allow(clippy::too_many_arguments)]
async fn non_stream_chat(
    state: &AppState,
    cfg: &UpstreamConfig,
    payload: &Value,
    requested_model: &str,
    display_name: &str,
    provider_name: &str,
    start: Instant,
    max_retries: u32,
) -> Response {
    let result = match upstream::chat(cfg, payload, max_retries).await {
        Ok(result) => result,
        Err(e) => {
            let secs = start.elapsed().as_secs_f64();
            let err_text = e.to_string();
            if let Some(custom) = match_custom_response(&state.store, &err_text).await {
                tracing::info!(
                    "{} | {:.2}s | 自定义响应(原错误: {})",
                    requested_model, secs, err_text
                );
                state.stats.request_success();
                return synthetic_response(&custom, requested_model, false);
            }
            tracing::error!("{} | {:.2}s | {}", requested_model, secs, err_text);
            state.stats.request_error();
            return GatewayError::Upstream(format!("请求失败: {}", err_text)).into_response();
        }
    };

    // 上游带回 usage 才落账，一次请求恰好一行
    if let Some(usage) = result.get("usage").and_then(|u| u.as_object()) {
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let total = usage.get("total_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        if let Err(e) = state
            .store
            .record_token_usage(display_name, provider_name, prompt, completion, total)
            .await
        {
            tracing::error!("记录 token 用量失败: {}", e);
        }
    }

    let secs = start.elapsed().as_secs_f64();
    tracing::info!("{} | {:.2}s", requested_model, secs);
    state.stats.request_success();
    // 原始 JSON 透传，保留上游扩展字段
    (StatusCode::OK, Json(result)).into_response()
}

#[allow(clippy::too_many_arguments)]
async fn stream_chat(
    state: Arc<AppState>,
    cfg: UpstreamConfig,
    payload: Value,
    requested_model: String,
    display_name: String,
    provider_name: String,
    permit: crate::limits::ConcurrencyPermit,
    start: Instant,
    max_retries: u32,
) -> Response {
    let resp = match upstream::chat_stream(&cfg, &payload, max_retries).await {
        Ok(resp) => resp,
        Err(e) => {
            let secs = start.elapsed().as_secs_f64();
            let err_text = e.to_string();
            if let Some(custom) = match_custom_response(&state.store, &err_text).await {
                tracing::info!(
                    "{} | {:.2}s | 自定义响应(原错误: {})",
                    requested_model, secs, err_text
                );
                state.stats.request_success();
                return synthetic_response(&custom, &requested_model, true);
            }
            tracing::error!("{} | {:.2}s | {}", requested_model, secs, err_text);
            state.stats.request_error();
            return GatewayError::Upstream(format!("请求失败: {}", err_text)).into_response();
        }
    };

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        // 首字节未发出，仍可返回普通 JSON 错误
        let body = resp.text().await.unwrap_or_default();
        let secs = start.elapsed().as_secs_f64();
        if let Some(custom) = match_custom_response(&state.store, &body).await {
            tracing::info!(
                "{} | {:.2}s | 自定义响应(原错误: status {})",
                requested_model, secs, status.as_u16()
            );
            state.stats.request_success();
            return synthetic_response(&custom, &requested_model, true);
        }
        tracing::error!(
            "{} | {:.2}s | status {}: {}",
            requested_model, secs, status.as_u16(), body
        );
        state.stats.request_error();
        let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (code, Json(json!({ "detail": body }))).into_response();
    }

    // 输入侧 token 只算一次，流结束若无上游 usage 则用它兜底
    let input_tokens = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| tokenizer::count_messages_tokens(messages, &requested_model))
        .unwrap_or(0);

    stream::forward_stream(
        state,
        resp,
        input_tokens,
        requested_model,
        display_name,
        provider_name,
        permit,
        start,
    )
}
