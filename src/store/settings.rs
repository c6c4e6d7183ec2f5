use serde::{Deserialize, Serialize};

use super::Store;
use crate::error::Result;

/// 流式模式开关：跟随客户端 / 强制流式 / 强制非流式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Auto,
    ForceStream,
    ForceNonStream,
}

impl Default for StreamMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl StreamMode {
    pub fn from_db_value(value: Option<&str>) -> Self {
        match value.unwrap_or_default() {
            "force_stream" => Self::ForceStream,
            "force_non_stream" => Self::ForceNonStream,
            _ => Self::Auto,
        }
    }

    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ForceStream => "force_stream",
            Self::ForceNonStream => "force_non_stream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "force_stream" => Some(Self::ForceStream),
            "force_non_stream" => Some(Self::ForceNonStream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: usize,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyConfig {
    pub enabled: bool,
    pub limit: i64,
}

/// 按提供商/模型维度的限流规则，持久化为 settings 里的 JSON 数组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRateLimitRule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// 0 表示任意提供商
    #[serde(default)]
    pub provider_id: i64,
    /// 空串表示任意模型
    #[serde(default)]
    pub model_name: String,
    pub max_requests: usize,
    pub window: u64,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomErrorRule {
    pub keyword: String,
    pub response: String,
}

impl Store {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(v) => Ok(Some(v?)),
            None => Ok(None),
        }
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            (key, value),
        )?;
        Ok(())
    }

    pub async fn stream_mode(&self) -> Result<StreamMode> {
        let value = self.get_setting("stream_mode").await?;
        Ok(StreamMode::from_db_value(value.as_deref()))
    }

    /// 上游调用最大重试次数，默认 3
    pub async fn max_retries(&self) -> Result<u32> {
        let value = self.get_setting("max_retries").await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(3))
    }

    pub async fn system_prompt(&self) -> Result<Option<String>> {
        let enabled = self.get_setting("system_prompt_enabled").await?;
        if enabled.as_deref() != Some("true") {
            return Ok(None);
        }
        Ok(self.get_setting("system_prompt").await?.filter(|p| !p.is_empty()))
    }

    pub async fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let enabled = self.get_setting("rate_limit_enabled").await?.as_deref() == Some("true");
        let max_requests = self
            .get_setting("rate_limit_max_requests")
            .await?
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60);
        let window_seconds = self
            .get_setting("rate_limit_window")
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60);
        Ok(RateLimitConfig {
            enabled,
            max_requests,
            window_seconds,
        })
    }

    pub async fn concurrency_config(&self) -> Result<ConcurrencyConfig> {
        let enabled = self.get_setting("concurrency_enabled").await?.as_deref() == Some("true");
        let limit = self
            .get_setting("concurrency_limit")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(0);
        Ok(ConcurrencyConfig {
            // limit 缺省或非法时视为不限制
            enabled: enabled && limit > 0,
            limit,
        })
    }

    pub async fn custom_rate_limit_rules(&self) -> Result<Vec<CustomRateLimitRule>> {
        let Some(raw) = self.get_setting("custom_rate_limit_rules").await? else {
            return Ok(Vec::new());
        };
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    pub async fn set_custom_rate_limit_rules(&self, rules: &[CustomRateLimitRule]) -> Result<()> {
        let raw = serde_json::to_string(rules)?;
        self.set_setting("custom_rate_limit_rules", &raw).await
    }

    pub async fn custom_error_rules(&self) -> Result<Vec<CustomErrorRule>> {
        let enabled = self.get_setting("custom_error_enabled").await?;
        if enabled.as_deref() != Some("true") {
            return Ok(Vec::new());
        }
        let Some(raw) = self.get_setting("custom_error_rules").await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    pub async fn set_custom_error_rules(&self, enabled: bool, rules: &[CustomErrorRule]) -> Result<()> {
        self.set_setting("custom_error_enabled", if enabled { "true" } else { "false" })
            .await?;
        let raw = serde_json::to_string(rules)?;
        self.set_setting("custom_error_rules", &raw).await
    }

    /// 启动时解析签名密钥：环境变量优先，其次数据库，最后生成并持久化
    pub async fn get_or_create_secret_key(&self) -> Result<String> {
        if let Some(key) = self.get_setting("secret_key").await? {
            if !key.is_empty() {
                return Ok(key);
            }
        }
        let key = crate::server::auth::generate_token();
        self.set_setting("secret_key", &key).await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;

    #[tokio::test]
    async fn settings_defaults_apply() {
        let (_dir, store) = open_temp().await;

        assert_eq!(store.stream_mode().await.unwrap(), StreamMode::Auto);
        assert_eq!(store.max_retries().await.unwrap(), 3);
        assert!(store.system_prompt().await.unwrap().is_none());

        let rl = store.rate_limit_config().await.unwrap();
        assert!(!rl.enabled);
        assert_eq!(rl.max_requests, 60);
        assert_eq!(rl.window_seconds, 60);

        let cc = store.concurrency_config().await.unwrap();
        assert!(!cc.enabled);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let (_dir, store) = open_temp().await;

        store.set_setting("stream_mode", "force_stream").await.unwrap();
        assert_eq!(store.stream_mode().await.unwrap(), StreamMode::ForceStream);

        store.set_setting("max_retries", "5").await.unwrap();
        assert_eq!(store.max_retries().await.unwrap(), 5);

        store.set_setting("system_prompt", "You are helpful.").await.unwrap();
        // 未启用时不生效
        assert!(store.system_prompt().await.unwrap().is_none());
        store.set_setting("system_prompt_enabled", "true").await.unwrap();
        assert_eq!(
            store.system_prompt().await.unwrap().as_deref(),
            Some("You are helpful.")
        );
    }

    #[tokio::test]
    async fn custom_error_rules_gated_by_enabled_flag() {
        let (_dir, store) = open_temp().await;
        let rules = vec![CustomErrorRule {
            keyword: "rate_limit_exceeded".into(),
            response: "稍安勿躁".into(),
        }];
        store.set_custom_error_rules(false, &rules).await.unwrap();
        assert!(store.custom_error_rules().await.unwrap().is_empty());

        store.set_custom_error_rules(true, &rules).await.unwrap();
        let loaded = store.custom_error_rules().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].keyword, "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn secret_key_is_persisted_once() {
        let (_dir, store) = open_temp().await;
        let first = store.get_or_create_secret_key().await.unwrap();
        let second = store.get_or_create_secret_key().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
