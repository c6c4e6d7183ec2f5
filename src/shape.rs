use serde_json::{Value, json};

use crate::store::settings::StreamMode;
use crate::store::types::ProviderType;

/// 应用流式模式开关，返回本次请求最终是否流式
pub fn apply_stream_mode(payload: &mut Value, mode: StreamMode) -> bool {
    let requested = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    match mode {
        StreamMode::Auto => requested,
        StreamMode::ForceStream => {
            payload["stream"] = Value::Bool(true);
            true
        }
        StreamMode::ForceNonStream => {
            payload["stream"] = Value::Bool(false);
            false
        }
    }
}

/// 流式请求补充 stream_options.include_usage，让上游在流里带回用量。
/// 客户端自带 stream_options 时不覆盖。
pub fn ensure_include_usage(payload: &mut Value) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if !obj.contains_key("stream_options") {
        obj.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );
    }
}

/// 在 messages 最前插入系统提示词；只前置，从不替换已有消息
pub fn inject_system_prompt(payload: &mut Value, prompt: &str) {
    let Some(messages) = payload.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    messages.insert(0, json!({ "role": "system", "content": prompt }));
}

/// 出站模型名替换为上游认识的 original_id；
/// Vertex Express 需要 google/ 前缀（已有前缀则不重复）
pub fn rewrite_model(payload: &mut Value, original_id: &str, provider_type: ProviderType) {
    let outbound = if provider_type == ProviderType::VertexExpress
        && !original_id.is_empty()
        && !original_id.starts_with("google/")
    {
        format!("google/{}", original_id)
    } else {
        original_id.to_string()
    };
    payload["model"] = Value::String(outbound);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> Value {
        json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "hi" }]
        })
    }

    #[test]
    fn auto_mode_honors_caller_flag() {
        let mut payload = base_payload();
        assert!(!apply_stream_mode(&mut payload, StreamMode::Auto));

        payload["stream"] = Value::Bool(true);
        assert!(apply_stream_mode(&mut payload, StreamMode::Auto));
    }

    #[test]
    fn force_modes_override_caller() {
        let mut payload = base_payload();
        assert!(apply_stream_mode(&mut payload, StreamMode::ForceStream));
        assert_eq!(payload["stream"], Value::Bool(true));

        let mut payload = base_payload();
        payload["stream"] = Value::Bool(true);
        assert!(!apply_stream_mode(&mut payload, StreamMode::ForceNonStream));
        assert_eq!(payload["stream"], Value::Bool(false));
    }

    #[test]
    fn include_usage_injected_only_when_absent() {
        let mut payload = base_payload();
        ensure_include_usage(&mut payload);
        assert_eq!(payload["stream_options"]["include_usage"], Value::Bool(true));

        let mut payload = base_payload();
        payload["stream_options"] = json!({ "include_usage": false });
        ensure_include_usage(&mut payload);
        assert_eq!(payload["stream_options"]["include_usage"], Value::Bool(false));
    }

    #[test]
    fn system_prompt_prepends() {
        let mut payload = base_payload();
        inject_system_prompt(&mut payload, "你是一个有帮助的助手");
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn system_prompt_skipped_without_messages() {
        let mut payload = json!({ "model": "gpt-4o" });
        inject_system_prompt(&mut payload, "prompt");
        assert!(payload.get("messages").is_none());
    }

    #[test]
    fn vertex_model_gets_google_prefix_once() {
        let mut payload = base_payload();
        rewrite_model(&mut payload, "gemini-2.0-flash", ProviderType::VertexExpress);
        assert_eq!(payload["model"], "google/gemini-2.0-flash");

        rewrite_model(&mut payload, "google/gemini-2.0-flash", ProviderType::VertexExpress);
        assert_eq!(payload["model"], "google/gemini-2.0-flash");
    }

    #[test]
    fn standard_model_is_replaced_verbatim() {
        let mut payload = base_payload();
        rewrite_model(&mut payload, "claude-3-opus", ProviderType::Standard);
        assert_eq!(payload["model"], "claude-3-opus");
    }
}
