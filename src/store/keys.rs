use super::Store;
use super::types::ProviderApiKey;
use crate::error::Result;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiKeyCreate {
    pub api_key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ApiKeyUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
}

impl Store {
    /// 轮询使用的有序启用密钥列表（按 id 升序，保证轮询顺序稳定）
    pub async fn list_active_keys(&self, provider_id: i64) -> Result<Vec<(i64, String)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, api_key FROM provider_api_keys
             WHERE provider_id = ?1 AND is_active = 1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([provider_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// 使用统计为旁路信息，失败只记日志不影响请求
    pub async fn bump_key_usage(&self, key_id: i64) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE provider_api_keys
             SET usage_count = usage_count + 1, last_used_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            [key_id],
        )?;
        Ok(())
    }

    pub async fn list_provider_keys(&self, provider_id: i64) -> Result<Vec<ProviderApiKey>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, api_key, COALESCE(name, ''), is_active,
                    COALESCE(usage_count, 0), last_used_at
             FROM provider_api_keys
             WHERE provider_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map([provider_id], |row| {
            let is_active: i64 = row.get(4)?;
            let last_used: Option<String> = row.get(6)?;
            Ok(ProviderApiKey {
                id: row.get(0)?,
                provider_id: row.get(1)?,
                api_key: row.get(2)?,
                name: row.get(3)?,
                is_active: is_active == 1,
                usage_count: row.get(5)?,
                last_used_at: last_used
                    .as_deref()
                    .and_then(|s| super::time::parse_utc_string(s).ok()),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn add_provider_key(&self, provider_id: i64, req: &ApiKeyCreate) -> Result<(i64, String)> {
        let conn = self.connection.lock().await;
        let name = if req.name.is_empty() {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM provider_api_keys WHERE provider_id = ?1",
                [provider_id],
                |row| row.get(0),
            )?;
            format!("密钥 {}", count + 1)
        } else {
            req.name.clone()
        };
        conn.execute(
            "INSERT INTO provider_api_keys (provider_id, api_key, name) VALUES (?1, ?2, ?3)",
            (provider_id, &req.api_key, &name),
        )?;
        Ok((conn.last_insert_rowid(), name))
    }

    pub async fn update_provider_key(&self, key_id: i64, req: &ApiKeyUpdate) -> Result<bool> {
        let conn = self.connection.lock().await;
        let mut affected = 0;
        if let Some(name) = &req.name {
            affected += conn.execute(
                "UPDATE provider_api_keys SET name = ?1 WHERE id = ?2",
                (name, key_id),
            )?;
        }
        if let Some(active) = req.is_active {
            affected += conn.execute(
                "UPDATE provider_api_keys SET is_active = ?1 WHERE id = ?2",
                (if active { 1i64 } else { 0 }, key_id),
            )?;
        }
        Ok(affected > 0)
    }

    pub async fn delete_provider_key(&self, key_id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let affected = conn.execute("DELETE FROM provider_api_keys WHERE id = ?1", [key_id])?;
        Ok(affected > 0)
    }
}
