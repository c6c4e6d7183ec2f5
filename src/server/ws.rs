use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::shape;
use crate::upstream::{self, UpstreamConfig};

use super::{AppState, auth, stream::UsageTotals, stream::scan_sse_lines};

/// `GET /v1/chat/completions/ws`。
/// 认证支持 `?api_key=` 查询参数或 Bearer 头；升级后每个文本帧
/// 是一次独立的 chat 请求，强制流式，上游 SSE 按行转发为文本帧。
pub async fn chat_completions_ws(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = params
        .get("api_key")
        .cloned()
        .filter(|k| !k.is_empty())
        .or_else(|| auth::bearer_token(&headers));
    let Some(api_key) = api_key else {
        return GatewayError::Unauthorized("缺少 API Key".into()).into_response();
    };

    match state.store.get_user_by_api_key(&api_key).await {
        Ok(Some(_)) => {}
        Ok(None) => return GatewayError::Unauthorized("无效的 API Key".into()).into_response(),
        Err(e) => return e.into_response(),
    }

    ws.on_upgrade(move |socket| ws_session(state, socket))
}

async fn ws_session(state: Arc<AppState>, mut socket: WebSocket) {
    while let Some(frame) = socket.recv().await {
        let message = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            // ping/pong 由协议层处理，二进制帧忽略
            Ok(_) => continue,
        };

        let mut payload: Value = match serde_json::from_str(&message) {
            Ok(v) => v,
            Err(_) => {
                let _ = send_error(&mut socket, "无效的 JSON").await;
                continue;
            }
        };

        let Some(model_name) = payload
            .get("model")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .filter(|m| !m.is_empty())
        else {
            let _ = send_error(&mut socket, "缺少 model 参数").await;
            continue;
        };

        // WebSocket 会话恒为流式
        payload["stream"] = Value::Bool(true);

        let resolved = match state.store.resolve_model(&model_name).await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                let _ = send_error(&mut socket, &format!("模型不存在: {}", model_name)).await;
                continue;
            }
            Err(e) => {
                let _ = send_error(&mut socket, &e.to_string()).await;
                continue;
            }
        };
        let (model, provider) = resolved;
        if !provider.is_active {
            let _ = send_error(&mut socket, &format!("提供商已禁用: {}", provider.name)).await;
            continue;
        }

        let api_key = match state.rotator.next_key(provider.id).await {
            Ok(key) => key,
            Err(e) => {
                let _ = send_error(&mut socket, &e.to_string()).await;
                continue;
            }
        };

        shape::rewrite_model(&mut payload, &model.original_id, provider.provider_type);
        let cfg = UpstreamConfig::from_provider(&provider, api_key);

        let display_name = if model.display_name.is_empty() {
            model_name.clone()
        } else {
            model.display_name.clone()
        };

        let start = Instant::now();
        state.stats.request_start();

        let resp = match upstream::chat_stream(&cfg, &payload, 0).await {
            Ok(resp) => resp,
            Err(e) => {
                let secs = start.elapsed().as_secs_f64();
                tracing::error!("WebSocket | {} | {:.2}s | {}", model_name, secs, e);
                state.stats.request_error();
                let _ = send_error(&mut socket, &format!("请求失败: {}", e)).await;
                continue;
            }
        };

        if resp.status() != reqwest::StatusCode::OK {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let secs = start.elapsed().as_secs_f64();
            tracing::error!("WebSocket | {} | {:.2}s | status {}", model_name, secs, status);
            state.stats.request_error();
            let _ = send_error(&mut socket, &body).await;
            continue;
        }

        // 输入侧估算：消息内容字符数 / 3，上游没带 usage 时使用
        let estimated_input_chars: usize = payload
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
                    .map(|c| c.len())
                    .sum()
            })
            .unwrap_or(0);

        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let mut buffer = String::new();
        let mut byte_stream = resp.bytes_stream();

        'relay: while let Some(next) = byte_stream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("WebSocket 读取响应错误: {}", e);
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // 每个完整行作为一个文本帧转发
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                scan_sse_lines(&line, &mut usage, &mut output);

                if socket.send(Message::Text(line.clone().into())).await.is_err() {
                    tracing::error!("WebSocket 写入错误");
                    break 'relay;
                }
                if line == "data: [DONE]" {
                    break 'relay;
                }
            }
        }

        let secs = start.elapsed().as_secs_f64();
        if usage.total > 0 {
            if let Err(e) = state
                .store
                .record_token_usage(&display_name, &provider.name, usage.prompt, usage.completion, usage.total)
                .await
            {
                tracing::error!("记录 token 用量失败: {}", e);
            }
            tracing::info!("WebSocket | {} | Token: {}", model_name, usage.total);
        } else {
            let input_tokens = if estimated_input_chars > 0 {
                (estimated_input_chars / 3).max(1)
            } else {
                0
            };
            let output_tokens = if output.is_empty() {
                0
            } else {
                (output.len() / 3).max(1)
            };
            if input_tokens > 0 || output_tokens > 0 {
                let total = input_tokens + output_tokens;
                if let Err(e) = state
                    .store
                    .record_token_usage(
                        &display_name,
                        &provider.name,
                        input_tokens as i64,
                        output_tokens as i64,
                        total as i64,
                    )
                    .await
                {
                    tracing::error!("记录 token 用量失败: {}", e);
                }
                tracing::info!("WebSocket | {} | Token估算: ~{}", model_name, total);
            }
        }

        tracing::info!("WebSocket | {} | {:.2}s", model_name, secs);
        state.stats.request_success();
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    let body = json!({ "error": message }).to_string();
    socket.send(Message::Text(body.into())).await
}
