use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// 模型名（小写子串匹配）到编码器的映射；
/// GPT 与 Claude 家族统一用 cl100k_base，未知模型也回落到它
const MODEL_ENCODINGS: &[(&str, &str)] = &[
    ("claude", "cl100k_base"),
    ("gpt-4", "cl100k_base"),
    ("gpt-4o", "cl100k_base"),
    ("gpt-3.5", "cl100k_base"),
    ("gpt-35", "cl100k_base"),
];

const DEFAULT_ENCODING: &str = "cl100k_base";

/// 每条消息的固定框架开销（role/content 分隔）
const TOKENS_PER_MESSAGE: usize = 3;
/// 每个请求的固定开销
const TOKENS_PER_REQUEST: usize = 3;
/// 低分辨率图片的基础 token 数
const TOKENS_PER_IMAGE: usize = 85;

fn encoding_for_model(model_name: &str) -> &'static str {
    let lower = model_name.to_lowercase();
    for (prefix, encoding) in MODEL_ENCODINGS {
        if lower.contains(prefix) {
            return encoding;
        }
    }
    DEFAULT_ENCODING
}

fn encoder_cache() -> &'static RwLock<HashMap<String, Arc<CoreBPE>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Arc<CoreBPE>>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// 编码器构建开销大，按编码名缓存（双重检查）
fn get_encoder(encoding_name: &str) -> Option<Arc<CoreBPE>> {
    if let Ok(cache) = encoder_cache().read() {
        if let Some(enc) = cache.get(encoding_name) {
            return Some(enc.clone());
        }
    }

    let mut cache = encoder_cache().write().ok()?;
    if let Some(enc) = cache.get(encoding_name) {
        return Some(enc.clone());
    }

    // 目前所有映射都指向 cl100k_base；按名缓存为未来的编码表留口
    let encoder = Arc::new(cl100k_base().ok()?);
    cache.insert(encoding_name.to_string(), encoder.clone());
    Some(encoder)
}

/// 计算文本的 token 数；编码器不可用时回落到字符估算
pub fn count_tokens(text: &str, model_name: &str) -> usize {
    match get_encoder(encoding_for_model(model_name)) {
        Some(enc) => enc.encode_with_special_tokens(text).len(),
        None => estimate_tokens(text),
    }
}

/// OpenAI chat 消息数组的 token 计数：
/// 每条消息 +3（框架），role、content 各自计数；
/// 多模态 content 只数 text 部分，每张图按低分辨率 85；
/// name 字段额外 +1；请求整体再 +3。
pub fn count_messages_tokens(messages: &[Value], model_name: &str) -> usize {
    let Some(enc) = get_encoder(encoding_for_model(model_name)) else {
        return estimate_messages_tokens(messages);
    };

    let mut total = 0;
    for message in messages {
        let Some(obj) = message.as_object() else {
            continue;
        };
        total += TOKENS_PER_MESSAGE;

        if let Some(role) = obj.get("role").and_then(|r| r.as_str()) {
            total += enc.encode_with_special_tokens(role).len();
        }

        match obj.get("content") {
            Some(Value::String(content)) => {
                total += enc.encode_with_special_tokens(content).len();
            }
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                total += enc.encode_with_special_tokens(text).len();
                            }
                        }
                        Some("image_url") => total += TOKENS_PER_IMAGE,
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
            total += enc.encode_with_special_tokens(name).len() + 1;
        }
    }

    total + TOKENS_PER_REQUEST
}

/// 估算兜底：中日韩字符按 1.5 字符/token，其余按 4 字符/token，
/// 非空文本至少 1
fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let cjk_count = text
        .chars()
        .filter(|c| (*c as u32) >= 0x4e00 && (*c as u32) <= 0x9fff)
        .count();
    let other_count = text.len() - cjk_count;
    let tokens = (cjk_count as f64 / 1.5 + other_count as f64 / 4.0) as usize;
    tokens.max(1)
}

fn estimate_messages_tokens(messages: &[Value]) -> usize {
    let total_chars: usize = messages
        .iter()
        .filter_map(|m| m.get("content").and_then(|c| c.as_str()))
        .map(|c| c.len())
        .sum();
    if total_chars == 0 {
        return 0;
    }
    (total_chars / 4).max(1)
}
