use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::store::types::{Provider, ProviderType};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 20;
/// 错误信息里保留的响应体上限，够关键词匹配即可
const ERROR_BODY_LIMIT: usize = 2048;

/// 单次上游调用所需的全部连接信息，从 Provider + 轮询到的密钥组装
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub provider_type: ProviderType,
    pub vertex_project: String,
    pub vertex_location: String,
    pub extra_headers: HashMap<String, String>,
    pub proxy_url: String,
}

impl UpstreamConfig {
    pub fn from_provider(provider: &Provider, api_key: String) -> Self {
        let extra_headers = if provider.extra_headers.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&provider.extra_headers).unwrap_or_default()
        };
        Self {
            base_url: provider.base_url.clone(),
            api_key,
            provider_type: provider.provider_type,
            vertex_project: provider.vertex_project.clone(),
            vertex_location: provider.vertex_location.clone(),
            extra_headers,
            proxy_url: provider.proxy_url.clone(),
        }
    }

    pub fn chat_url(&self) -> String {
        match self.provider_type {
            ProviderType::VertexExpress => {
                let location = if self.vertex_location.is_empty() {
                    "global"
                } else {
                    &self.vertex_location
                };
                format!(
                    "https://aiplatform.googleapis.com/v1beta1/projects/{}/locations/{}/endpoints/openapi/chat/completions",
                    self.vertex_project, location
                )
            }
            ProviderType::Standard => {
                format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
            }
        }
    }

    /// Vertex Express 不提供模型列表
    pub fn models_url(&self) -> Option<String> {
        match self.provider_type {
            ProviderType::VertexExpress => None,
            ProviderType::Standard => {
                Some(format!("{}/models", self.base_url.trim_end_matches('/')))
            }
        }
    }

    /// 默认头 + 认证头，配置的附加头最后合并（允许覆盖）
    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.provider_type != ProviderType::VertexExpress {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (k, v) in &self.extra_headers {
            builder = builder.header(k, v);
        }
        builder
    }

    fn query_params(&self) -> Vec<(&'static str, &str)> {
        match self.provider_type {
            // Vertex Express 用 ?key= 认证，不带 Authorization 头
            ProviderType::VertexExpress => vec![("key", self.api_key.as_str())],
            ProviderType::Standard => Vec::new(),
        }
    }
}

fn client_pool() -> &'static RwLock<HashMap<String, Client>> {
    static POOL: OnceLock<RwLock<HashMap<String, Client>>> = OnceLock::new();
    POOL.get_or_init(|| RwLock::new(HashMap::new()))
}

fn build_client(proxy_url: &str) -> Result<Client> {
    let mut builder = Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .timeout(REQUEST_TIMEOUT);
    if !proxy_url.is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    Ok(builder.build()?)
}

/// 每个出站代理地址共享一个长生命周期客户端（空串表示直连）
fn pooled_client(proxy_url: &str) -> Result<Client> {
    if let Ok(pool) = client_pool().read() {
        if let Some(client) = pool.get(proxy_url) {
            return Ok(client.clone());
        }
    }

    let mut pool = client_pool()
        .write()
        .map_err(|_| GatewayError::Config("client pool lock poisoned".into()))?;
    // double check
    if let Some(client) = pool.get(proxy_url) {
        return Ok(client.clone());
    }
    let client = build_client(proxy_url)?;
    pool.insert(proxy_url.to_string(), client.clone());
    Ok(client)
}

/// 提供商代理配置变更时调用；在途请求持有自己的 Client 克隆，不受影响
pub fn invalidate_client(proxy_url: &str) {
    if let Ok(mut pool) = client_pool().write() {
        pool.remove(proxy_url);
    }
}

fn truncated(body: &str) -> &str {
    let mut end = body.len().min(ERROR_BODY_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

async fn backoff(attempt: u32) {
    // 100ms, 200ms, 400ms...
    let delay = Duration::from_millis(100u64.saturating_mul(1 << (attempt - 1).min(16)));
    tokio::time::sleep(delay).await;
}

pub async fn list_models(cfg: &UpstreamConfig) -> Result<Vec<Value>> {
    let Some(models_url) = cfg.models_url() else {
        return Ok(Vec::new());
    };
    let client = pooled_client(&cfg.proxy_url)?;
    let mut builder = client.get(&models_url);
    builder = cfg.apply_headers(builder);
    let params = cfg.query_params();
    if !params.is_empty() {
        builder = builder.query(&params);
    }

    let resp = builder.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GatewayError::Upstream(format!(
            "status {}: {}",
            status.as_u16(),
            truncated(&body)
        )));
    }

    let parsed: Value = resp.json().await?;
    Ok(parsed
        .get("data")
        .and_then(|d| d.as_array())
        .cloned()
        .unwrap_or_default())
}

/// 非流式聊天调用。传输错误与 5xx 重试（指数退避），4xx 立即失败。
/// 总尝试次数 max_retries + 1。
pub async fn chat(cfg: &UpstreamConfig, payload: &Value, max_retries: u32) -> Result<Value> {
    let client = pooled_client(&cfg.proxy_url)?;
    let chat_url = cfg.chat_url();
    let total = max_retries + 1;

    let mut last_err = None;
    for attempt in 1..=total {
        if attempt > 1 {
            backoff(attempt - 1).await;
        }

        let mut builder = client.post(&chat_url).json(payload);
        builder = cfg.apply_headers(builder);
        let params = cfg.query_params();
        if !params.is_empty() {
            builder = builder.query(&params);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "upstream request failed");
                last_err = Some(GatewayError::Http(e));
                continue;
            }
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        let err = GatewayError::Upstream(format!(
            "status {}: {}",
            status.as_u16(),
            truncated(&body)
        ));
        if status.as_u16() >= 500 {
            tracing::warn!(attempt, status = status.as_u16(), "upstream 5xx, will retry");
            last_err = Some(err);
            continue;
        }
        // 4xx 不重试
        return Err(err);
    }

    Err(last_err.unwrap_or_else(|| GatewayError::Upstream("upstream request failed".into())))
}

/// 流式聊天调用：返回活的响应句柄。重试策略与非流式一致，
/// 但最后一次得到的非 2xx 响应原样交给调用方读取响应体。
pub async fn chat_stream(
    cfg: &UpstreamConfig,
    payload: &Value,
    max_retries: u32,
) -> Result<reqwest::Response> {
    let client = pooled_client(&cfg.proxy_url)?;
    let chat_url = cfg.chat_url();
    let total = max_retries + 1;

    let mut last_err = None;
    for attempt in 1..=total {
        if attempt > 1 {
            backoff(attempt - 1).await;
        }

        let mut builder = client.post(&chat_url).json(payload);
        builder = cfg.apply_headers(builder);
        let params = cfg.query_params();
        if !params.is_empty() {
            builder = builder.query(&params);
        }

        match builder.send().await {
            Ok(resp) if resp.status().as_u16() >= 500 && attempt < total => {
                tracing::warn!(attempt, status = resp.status().as_u16(), "upstream 5xx, will retry");
                last_err = Some(GatewayError::Upstream(format!(
                    "status {}",
                    resp.status().as_u16()
                )));
            }
            Ok(resp) => return Ok(resp),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "upstream request failed");
                last_err = Some(GatewayError::Http(e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| GatewayError::Upstream("upstream request failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_cfg() -> UpstreamConfig {
        UpstreamConfig {
            base_url: "https://api.openai.com/v1/".into(),
            api_key: "sk-test".into(),
            provider_type: ProviderType::Standard,
            vertex_project: String::new(),
            vertex_location: String::new(),
            extra_headers: HashMap::new(),
            proxy_url: String::new(),
        }
    }

    #[test]
    fn standard_urls_trim_trailing_slash() {
        let cfg = standard_cfg();
        assert_eq!(cfg.chat_url(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            cfg.models_url().unwrap(),
            "https://api.openai.com/v1/models"
        );
        assert!(cfg.query_params().is_empty());
    }

    #[test]
    fn vertex_urls_are_fixed_endpoint() {
        let cfg = UpstreamConfig {
            base_url: String::new(),
            api_key: "vk-1".into(),
            provider_type: ProviderType::VertexExpress,
            vertex_project: "p1".into(),
            vertex_location: "global".into(),
            extra_headers: HashMap::new(),
            proxy_url: String::new(),
        };
        assert_eq!(
            cfg.chat_url(),
            "https://aiplatform.googleapis.com/v1beta1/projects/p1/locations/global/endpoints/openapi/chat/completions"
        );
        assert!(cfg.models_url().is_none());
        assert_eq!(cfg.query_params(), vec![("key", "vk-1")]);
    }

    #[test]
    fn vertex_location_defaults_to_global() {
        let cfg = UpstreamConfig {
            base_url: String::new(),
            api_key: "vk-1".into(),
            provider_type: ProviderType::VertexExpress,
            vertex_project: "p1".into(),
            vertex_location: String::new(),
            extra_headers: HashMap::new(),
            proxy_url: String::new(),
        };
        assert!(cfg.chat_url().contains("/locations/global/"));
    }

    #[test]
    fn pool_reuses_and_invalidates() {
        let _ = pooled_client("").unwrap();
        assert!(client_pool().read().unwrap().contains_key(""));
        invalidate_client("");
        assert!(!client_pool().read().unwrap().contains_key(""));
    }

    #[test]
    fn error_body_is_truncated_on_char_boundary() {
        let body = "错".repeat(1000);
        let cut = truncated(&body);
        assert!(cut.len() <= ERROR_BODY_LIMIT);
        assert!(body.starts_with(cut));
    }
}
