use thiserror::Error;

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// 全局滑动窗口限流触发
    #[error("请求过于频繁，请稍后重试 rate_limit_exceeded")]
    RateLimited,

    /// 自定义限流规则触发，携带规则名
    #[error("触发自定义速率限制规则 [{0}]，请稍后重试 custom_rate_limit_exceeded")]
    CustomRateLimited(String),

    #[error("服务器繁忙，请稍后重试 concurrency_limit_exceeded")]
    ConcurrencyExceeded,

    /// 上游最终失败（保留状态码 + 响应体前缀，供关键词匹配）
    #[error("{0}")]
    Upstream(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Serialize)]
struct DetailBody {
    detail: String,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPayload(_) | GatewayError::Config(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited | GatewayError::CustomRateLimited(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::ProviderUnavailable(_) | GatewayError::ConcurrencyExceeded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 限流/并发类拒绝使用 OpenAI 兼容的 error 包裹格式
    fn openai_envelope(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::RateLimited => Some(json!({
                "error": {
                    "message": "请求过于频繁，请稍后重试",
                    "type": "rate_limit_error",
                    "code": "rate_limit_exceeded",
                }
            })),
            GatewayError::CustomRateLimited(name) => Some(json!({
                "error": {
                    "message": format!("触发自定义速率限制规则 [{}]，请稍后重试", name),
                    "type": "rate_limit_error",
                    "code": "custom_rate_limit_exceeded",
                }
            })),
            GatewayError::ConcurrencyExceeded => Some(json!({
                "error": {
                    "message": "服务器繁忙，请稍后重试",
                    "type": "concurrency_limit_error",
                    "code": "concurrency_limit_exceeded",
                }
            })),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if let Some(envelope) = self.openai_envelope() {
            return (status, Json(envelope)).into_response();
        }
        let body = DetailBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_429_and_503() {
        assert_eq!(
            GatewayError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CustomRateLimited("burst".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::ConcurrencyExceeded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn rate_limit_message_carries_matchable_code() {
        assert!(GatewayError::RateLimited.to_string().contains("rate_limit_exceeded"));
        let msg = GatewayError::CustomRateLimited("burst".into()).to_string();
        assert!(msg.contains("custom_rate_limit_exceeded"));
        assert!(msg.contains("[burst]"));
    }

    #[test]
    fn openai_envelope_only_for_admission_errors() {
        assert!(GatewayError::RateLimited.openai_envelope().is_some());
        assert!(GatewayError::ConcurrencyExceeded.openai_envelope().is_some());
        assert!(
            GatewayError::NotFound("model not found".into())
                .openai_envelope()
                .is_none()
        );
    }
}
