use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;

use crate::limits::ConcurrencyPermit;
use crate::tokenizer;

use super::AppState;

/// 流内累计的用量。上游分片里的 usage 是累计值，后到覆盖先到。
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UsageTotals {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

/// 逐行解析一段完整的 SSE 文本（最后一个换行之前的部分）。
/// 只读取不改写：提取 usage 与 choices[0].delta.content。
pub(crate) fn scan_sse_lines(complete: &str, usage: &mut UsageTotals, output: &mut String) {
    for line in complete.lines() {
        let line = line.trim();
        if !line.starts_with("data: ") || line.contains("[DONE]") {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&line[6..]) else {
            continue;
        };
        if let Some(u) = chunk.get("usage") {
            if let Some(v) = u.get("prompt_tokens").and_then(|x| x.as_i64()) {
                usage.prompt = v;
            }
            if let Some(v) = u.get("completion_tokens").and_then(|x| x.as_i64()) {
                usage.completion = v;
            }
            if let Some(v) = u.get("total_tokens").and_then(|x| x.as_i64()) {
                usage.total = v;
            }
        }
        if let Some(content) = chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            output.push_str(content);
        }
    }
}

/// 客户端提前挂断时响应体流会被整体丢弃，收尾代码不再执行；
/// 由析构兜底记一笔成功（数据可能已部分送达），不记用量。
struct StreamGuard {
    state: Arc<AppState>,
    model: String,
    start: Instant,
    completed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.completed {
            let secs = self.start.elapsed().as_secs_f64();
            tracing::info!("{} | {:.2}s | 流被中断", self.model, secs);
            self.state.stats.request_success();
        }
    }
}

/// SSE 透传主体。单任务完成上游读与客户端写；
/// 上游字节原样转发恰好一次，解析只在完整行上进行。
#[allow(clippy::too_many_arguments)]
pub(crate) fn forward_stream(
    state: Arc<AppState>,
    resp: reqwest::Response,
    input_tokens: usize,
    requested_model: String,
    display_name: String,
    provider_name: String,
    permit: ConcurrencyPermit,
    start: Instant,
) -> Response {
    let byte_stream = resp.bytes_stream();

    let body_stream = async_stream::stream! {
        // 并发名额跟随响应体生命周期
        let _permit = permit;
        let mut guard = StreamGuard {
            state: state.clone(),
            model: requested_model.clone(),
            start,
            completed: false,
        };

        futures_util::pin_mut!(byte_stream);
        let mut buffer = String::new();
        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let mut upstream_failed = false;

        while let Some(next) = byte_stream.next().await {
            match next {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    // 只处理到最后一个换行，残缺行留到下次拼接
                    if let Some(pos) = buffer.rfind('\n') {
                        let complete: String = buffer.drain(..=pos).collect();
                        scan_sse_lines(&complete, &mut usage, &mut output);
                    }
                    yield Ok::<_, Infallible>(bytes);
                }
                Err(e) => {
                    let secs = start.elapsed().as_secs_f64();
                    tracing::error!("{} | {:.2}s | {}", requested_model, secs, e);
                    guard.completed = true;
                    state.stats.request_error();
                    upstream_failed = true;
                    break;
                }
            }
        }
        // 中途失败不记用量；EOF 时所有字节都已交给客户端，恰好记录一次
        if !upstream_failed {
            guard.completed = true;
            let secs = start.elapsed().as_secs_f64();
            if usage.total > 0 {
                if let Err(e) = state
                    .store
                    .record_token_usage(&display_name, &provider_name, usage.prompt, usage.completion, usage.total)
                    .await
                {
                    tracing::error!("记录 token 用量失败: {}", e);
                }
                tracing::info!(
                    "{} | {:.2}s | Token: {} (in={}, out={})",
                    requested_model, secs, usage.total, usage.prompt, usage.completion
                );
            } else {
                let output_tokens = tokenizer::count_tokens(&output, &requested_model);
                if input_tokens > 0 || output_tokens > 0 {
                    let total = input_tokens + output_tokens;
                    if let Err(e) = state
                        .store
                        .record_token_usage(
                            &display_name,
                            &provider_name,
                            input_tokens as i64,
                            output_tokens as i64,
                            total as i64,
                        )
                        .await
                    {
                        tracing::error!("记录 token 用量失败: {}", e);
                    }
                    tracing::info!(
                        "{} | {:.2}s | Token: {} (in={}, out={})",
                        requested_model, secs, total, input_tokens, output_tokens
                    );
                } else {
                    tracing::info!("{} | {:.2}s", requested_model, secs);
                }
            }
            state.stats.request_success();
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_latest_value_wins() {
        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1,\"total_tokens\":6}}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n",
        );
        scan_sse_lines(chunk, &mut usage, &mut output);
        assert_eq!(usage.total, 7);
        assert_eq!(usage.completion, 2);
        assert_eq!(output, "hello");
    }

    #[test]
    fn done_marker_and_non_data_lines_are_skipped() {
        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let chunk = concat!(
            ": keep-alive comment\n",
            "event: message\n",
            "data: [DONE]\n",
            "\n",
        );
        scan_sse_lines(chunk, &mut usage, &mut output);
        assert_eq!(usage.total, 0);
        assert!(output.is_empty());
    }

    #[test]
    fn malformed_json_does_not_abort_scan() {
        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let chunk = concat!(
            "data: {broken json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        scan_sse_lines(chunk, &mut usage, &mut output);
        assert_eq!(output, "ok");
    }

    #[test]
    fn partial_line_buffering_splits_mid_json() {
        // 同一条 JSON 被拆成两个到达分片：只有拼出完整行后才解析
        let mut usage = UsageTotals::default();
        let mut output = String::new();
        let mut buffer = String::new();

        let part1 = "data: {\"choices\":[{\"delta\":{\"cont";
        let part2 = "ent\":\"hi\"}}]}\ndata: {\"cho";

        buffer.push_str(part1);
        assert!(buffer.rfind('\n').is_none());

        buffer.push_str(part2);
        let pos = buffer.rfind('\n').unwrap();
        let complete: String = buffer.drain(..=pos).collect();
        scan_sse_lines(&complete, &mut usage, &mut output);
        assert_eq!(output, "hi");
        // 残缺的后半行留在缓冲区
        assert_eq!(buffer, "data: {\"cho");
    }
}
