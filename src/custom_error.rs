use chrono::Utc;
use serde_json::{Value, json};

use crate::store::Store;

/// 错误文本与配置规则做小写子串匹配，命中返回替身文案。
/// 规则未启用或没有规则时恒为 None。
pub async fn match_custom_response(store: &Store, error_text: &str) -> Option<String> {
    let rules = store.custom_error_rules().await.ok()?;
    if rules.is_empty() {
        return None;
    }
    let lowered = error_text.to_lowercase();
    rules
        .iter()
        .find(|rule| !rule.keyword.is_empty() && lowered.contains(&rule.keyword.to_lowercase()))
        .map(|rule| rule.response.clone())
}

fn fake_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("chatcmpl-fake-{}", nanos)
}

/// 伪造一份正常的非流式 chat completion。
/// 除 id 前缀外与真实响应不可区分；状态码由调用方给 200。
pub fn fake_completion(content: &str, model: &str) -> Value {
    let completion_tokens = content.len() / 4;
    json!({
        "id": fake_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": completion_tokens,
            "total_tokens": completion_tokens
        }
    })
}

/// 伪造的流式响应体：role、content、finish 三个 chunk 加 [DONE]
pub fn fake_stream_body(content: &str, model: &str) -> String {
    let id = fake_id();
    let created = Utc::now().timestamp();

    let chunks = [
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": { "role": "assistant" }, "finish_reason": null }]
        }),
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
        }),
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }]
        }),
    ];

    let mut body = String::new();
    for chunk in &chunks {
        body.push_str("data: ");
        body.push_str(&chunk.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::settings::CustomErrorRule;
    use crate::store::test_support::open_temp;

    #[tokio::test]
    async fn keyword_match_is_case_insensitive() {
        let (_dir, store) = open_temp().await;
        store
            .set_custom_error_rules(
                true,
                &[CustomErrorRule {
                    keyword: "Rate_Limit_Exceeded".into(),
                    response: "请稍后再试".into(),
                }],
            )
            .await
            .unwrap();

        let hit = match_custom_response(&store, "upstream said RATE_LIMIT_EXCEEDED today").await;
        assert_eq!(hit.as_deref(), Some("请稍后再试"));

        let miss = match_custom_response(&store, "quota exhausted").await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let (_dir, store) = open_temp().await;
        store
            .set_custom_error_rules(
                true,
                &[
                    CustomErrorRule { keyword: "status 5".into(), response: "first".into() },
                    CustomErrorRule { keyword: "status 503".into(), response: "second".into() },
                ],
            )
            .await
            .unwrap();
        let hit = match_custom_response(&store, "status 503: overloaded").await;
        assert_eq!(hit.as_deref(), Some("first"));
    }

    #[test]
    fn fake_completion_shape() {
        let resp = fake_completion("hello there", "gpt-4o");
        assert!(resp["id"].as_str().unwrap().starts_with("chatcmpl-fake-"));
        assert_eq!(resp["object"], "chat.completion");
        assert_eq!(resp["choices"][0]["message"]["content"], "hello there");
        assert_eq!(resp["choices"][0]["finish_reason"], "stop");
        // completion_tokens 按 len/4 估算
        assert_eq!(resp["usage"]["completion_tokens"], 11 / 4);
        assert_eq!(resp["usage"]["total_tokens"], 11 / 4);
    }

    #[test]
    fn fake_stream_has_three_chunks_and_done() {
        let body = fake_stream_body("ok", "gpt-4o");
        let data_lines: Vec<&str> = body
            .lines()
            .filter(|l| l.starts_with("data: "))
            .collect();
        assert_eq!(data_lines.len(), 4);
        assert_eq!(data_lines[3], "data: [DONE]");

        let first: Value = serde_json::from_str(&data_lines[0][6..]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        let second: Value = serde_json::from_str(&data_lines[1][6..]).unwrap();
        assert_eq!(second["choices"][0]["delta"]["content"], "ok");
        let third: Value = serde_json::from_str(&data_lines[2][6..]).unwrap();
        assert_eq!(third["choices"][0]["finish_reason"], "stop");
        // 三个 chunk 共享同一个伪造 id
        assert_eq!(first["id"], third["id"]);
    }
}
