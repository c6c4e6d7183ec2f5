use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Standard,
    VertexExpress,
}

impl Default for ProviderType {
    fn default() -> Self {
        Self::Standard
    }
}

impl ProviderType {
    pub fn from_db_value(value: &str) -> Self {
        match value {
            "vertex_express" => Self::VertexExpress,
            _ => Self::Standard,
        }
    }

    pub fn as_db_value(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::VertexExpress => "vertex_express",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub model_prefix: String,
    pub provider_type: ProviderType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vertex_project: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vertex_location: String,
    /// JSON object 文本，透传给上游的附加请求头
    #[serde(skip_serializing)]
    pub extra_headers: String,
    #[serde(skip_serializing)]
    pub proxy_url: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: i64,
    pub provider_id: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider_name: String,
    pub original_id: String,
    pub display_name: String,
    pub custom_name: bool,
    pub is_active: bool,
}

impl Model {
    /// 客户端可见的模型标识：display_name 优先，缺省回落 original_id
    pub fn visible_id(&self) -> &str {
        if self.display_name.is_empty() {
            &self.original_id
        } else {
            &self.display_name
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderApiKey {
    pub id: i64,
    pub provider_id: i64,
    pub api_key: String,
    pub name: String,
    pub is_active: bool,
    pub usage_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub api_key: String,
    pub is_admin: bool,
    pub is_active: bool,
}
