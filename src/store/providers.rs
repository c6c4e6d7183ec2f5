use rusqlite::Row;

use super::Store;
use super::types::{Provider, ProviderType};
use crate::error::Result;

const PROVIDER_COLUMNS: &str = "id, name, base_url, COALESCE(model_prefix, ''), provider_type,
       COALESCE(vertex_project, ''), COALESCE(vertex_location, 'global'),
       COALESCE(extra_headers, ''), COALESCE(proxy_url, ''), is_active";

pub(super) fn provider_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Provider> {
    let provider_type: String = row.get(offset + 4)?;
    let is_active: i64 = row.get(offset + 9)?;
    Ok(Provider {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        base_url: row.get(offset + 2)?,
        model_prefix: row.get(offset + 3)?,
        provider_type: ProviderType::from_db_value(&provider_type),
        vertex_project: row.get(offset + 5)?,
        vertex_location: row.get(offset + 6)?,
        extra_headers: row.get(offset + 7)?,
        proxy_url: row.get(offset + 8)?,
        is_active: is_active == 1,
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderCreate {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub model_prefix: String,
    #[serde(default)]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub vertex_project: String,
    #[serde(default)]
    pub vertex_location: String,
    #[serde(default)]
    pub extra_headers: String,
    #[serde(default)]
    pub proxy_url: String,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub model_prefix: Option<String>,
    pub provider_type: Option<String>,
    pub vertex_project: Option<String>,
    pub vertex_location: Option<String>,
    pub extra_headers: Option<String>,
    pub proxy_url: Option<String>,
    pub is_active: Option<bool>,
}

impl Store {
    pub async fn list_providers(&self) -> Result<Vec<Provider>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM providers", PROVIDER_COLUMNS))?;
        let rows = stmt.query_map([], |row| provider_from_row(row, 0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn get_provider(&self, id: i64) -> Result<Option<Provider>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM providers WHERE id = ?1",
            PROVIDER_COLUMNS
        ))?;
        let mut rows = stmt.query_map([id], |row| provider_from_row(row, 0))?;
        match rows.next() {
            Some(p) => Ok(Some(p?)),
            None => Ok(None),
        }
    }

    /// 创建提供商并把初始密钥写入轮询密钥表
    pub async fn create_provider(&self, req: &ProviderCreate) -> Result<i64> {
        let provider_type = req
            .provider_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "standard".to_string());
        let vertex_location = if req.vertex_location.is_empty() {
            "global".to_string()
        } else {
            req.vertex_location.clone()
        };

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO providers (name, base_url, model_prefix, provider_type,
                                    vertex_project, vertex_location, extra_headers, proxy_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &req.name,
                &req.base_url,
                &req.model_prefix,
                &provider_type,
                &req.vertex_project,
                &vertex_location,
                &req.extra_headers,
                &req.proxy_url,
            ),
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO provider_api_keys (provider_id, api_key, name) VALUES (?1, ?2, ?3)",
            (id, &req.api_key, "密钥 1"),
        )?;
        Ok(id)
    }

    /// 部分更新；返回更新前的 (model_prefix, proxy_url)，供调用方同步
    /// 模型显示名与失效连接池。
    pub async fn update_provider(
        &self,
        id: i64,
        req: &ProviderUpdate,
    ) -> Result<Option<(String, String)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT COALESCE(model_prefix, ''), COALESCE(proxy_url, '') FROM providers WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let Some(previous) = rows.next() else {
            return Ok(None);
        };
        let previous = previous?;
        drop(rows);
        drop(stmt);

        let mut updates: Vec<(&str, Box<dyn rusqlite::ToSql>)> = Vec::new();
        if let Some(v) = &req.name {
            updates.push(("name = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.base_url {
            updates.push(("base_url = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.model_prefix {
            updates.push(("model_prefix = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.provider_type {
            updates.push(("provider_type = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.vertex_project {
            updates.push(("vertex_project = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.vertex_location {
            updates.push(("vertex_location = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.extra_headers {
            updates.push(("extra_headers = ?", Box::new(v.clone())));
        }
        if let Some(v) = &req.proxy_url {
            updates.push(("proxy_url = ?", Box::new(v.clone())));
        }
        if let Some(v) = req.is_active {
            updates.push(("is_active = ?", Box::new(if v { 1i64 } else { 0 })));
        }

        if !updates.is_empty() {
            let mut sql = String::from("UPDATE providers SET ");
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::new();
            for (i, (fragment, value)) in updates.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(fragment);
                params.push(value.as_ref());
            }
            sql.push_str(", updated_at = CURRENT_TIMESTAMP WHERE id = ?");
            params.push(&id);
            conn.execute(&sql, params.as_slice())?;
        }

        Ok(Some(previous))
    }

    /// 删除提供商并级联其模型与密钥；返回其 proxy_url 供连接池失效
    pub async fn delete_provider(&self, id: i64) -> Result<Option<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare("SELECT COALESCE(proxy_url, '') FROM providers WHERE id = ?1")?;
        let mut rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
        let Some(proxy_url) = rows.next() else {
            return Ok(None);
        };
        let proxy_url = proxy_url?;
        drop(rows);
        drop(stmt);

        conn.execute("DELETE FROM models WHERE provider_id = ?1", [id])?;
        conn.execute("DELETE FROM provider_api_keys WHERE provider_id = ?1", [id])?;
        conn.execute("DELETE FROM providers WHERE id = ?1", [id])?;
        Ok(Some(proxy_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;

    fn sample_create(name: &str) -> ProviderCreate {
        ProviderCreate {
            name: name.to_string(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "sk-test".into(),
            model_prefix: String::new(),
            provider_type: None,
            vertex_project: String::new(),
            vertex_location: String::new(),
            extra_headers: String::new(),
            proxy_url: String::new(),
        }
    }

    #[tokio::test]
    async fn provider_crud_roundtrip() {
        let (_dir, store) = open_temp().await;

        let id = store.create_provider(&sample_create("openai")).await.unwrap();
        let provider = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(provider.name, "openai");
        assert_eq!(provider.provider_type, ProviderType::Standard);
        assert_eq!(provider.vertex_location, "global");
        assert!(provider.is_active);

        // 初始密钥随创建落库
        let keys = store.list_provider_keys(id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].api_key, "sk-test");

        let previous = store
            .update_provider(
                id,
                &ProviderUpdate {
                    proxy_url: Some("http://127.0.0.1:7890".into()),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous, (String::new(), String::new()));

        let provider = store.get_provider(id).await.unwrap().unwrap();
        assert!(!provider.is_active);
        assert_eq!(provider.proxy_url, "http://127.0.0.1:7890");

        let proxy = store.delete_provider(id).await.unwrap().unwrap();
        assert_eq!(proxy, "http://127.0.0.1:7890");
        assert!(store.get_provider(id).await.unwrap().is_none());
        assert!(store.list_provider_keys(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vertex_provider_keeps_type() {
        let (_dir, store) = open_temp().await;
        let mut req = sample_create("vertex");
        req.provider_type = Some("vertex_express".into());
        req.vertex_project = "p1".into();
        let id = store.create_provider(&req).await.unwrap();
        let provider = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(provider.provider_type, ProviderType::VertexExpress);
        assert_eq!(provider.vertex_project, "p1");
    }
}
