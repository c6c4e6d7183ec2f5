use rusqlite::Row;

use super::Store;
use super::providers::provider_from_row;
use super::types::{Model, Provider};
use crate::error::Result;

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<Model> {
    let display_name: Option<String> = row.get(4)?;
    let custom_name: i64 = row.get(5)?;
    let is_active: i64 = row.get(6)?;
    Ok(Model {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        provider_name: row.get(2)?,
        original_id: row.get(3)?,
        display_name: display_name.unwrap_or_default(),
        custom_name: custom_name == 1,
        is_active: is_active == 1,
    })
}

const MODEL_COLUMNS: &str =
    "m.id, m.provider_id, p.name, m.original_id, m.display_name, COALESCE(m.custom_name, 0), m.is_active";

const RESOLVE_SQL_DISPLAY: &str = "SELECT m.id, m.provider_id, p.name, m.original_id, m.display_name,
       COALESCE(m.custom_name, 0), m.is_active,
       p.id, p.name, p.base_url, COALESCE(p.model_prefix, ''), p.provider_type,
       COALESCE(p.vertex_project, ''), COALESCE(p.vertex_location, 'global'),
       COALESCE(p.extra_headers, ''), COALESCE(p.proxy_url, ''), p.is_active
FROM models m JOIN providers p ON m.provider_id = p.id
WHERE m.display_name = ?1 AND m.is_active = 1 AND p.is_active = 1";

const RESOLVE_SQL_ORIGINAL: &str = "SELECT m.id, m.provider_id, p.name, m.original_id, m.display_name,
       COALESCE(m.custom_name, 0), m.is_active,
       p.id, p.name, p.base_url, COALESCE(p.model_prefix, ''), p.provider_type,
       COALESCE(p.vertex_project, ''), COALESCE(p.vertex_location, 'global'),
       COALESCE(p.extra_headers, ''), COALESCE(p.proxy_url, ''), p.is_active
FROM models m JOIN providers p ON m.provider_id = p.id
WHERE m.original_id = ?1 AND m.is_active = 1 AND p.is_active = 1";

impl Store {
    /// 模型名解析，按顺序三次查找，命中即返回：
    /// 1. display_name 精确匹配
    /// 2. original_id 精确匹配
    /// 3. 含 `/` 时去掉第一个 `/` 之前的前缀，再按 original_id 匹配
    ///
    /// 三次查找都只考虑启用的模型与启用的提供商。
    pub async fn resolve_model(&self, model_name: &str) -> Result<Option<(Model, Provider)>> {
        let conn = self.connection.lock().await;

        let run = |sql: &str, needle: &str| -> rusqlite::Result<Option<(Model, Provider)>> {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query_map([needle], |row| {
                Ok((model_from_row(row)?, provider_from_row(row, 7)?))
            })?;
            match rows.next() {
                Some(hit) => Ok(Some(hit?)),
                None => Ok(None),
            }
        };

        if let Some(hit) = run(RESOLVE_SQL_DISPLAY, model_name)? {
            return Ok(Some(hit));
        }
        if let Some(hit) = run(RESOLVE_SQL_ORIGINAL, model_name)? {
            return Ok(Some(hit));
        }
        if let Some(idx) = model_name.find('/') {
            let stripped = &model_name[idx + 1..];
            if let Some(hit) = run(RESOLVE_SQL_ORIGINAL, stripped)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// `/v1/models` 数据源：启用的模型 × 启用的提供商
    pub async fn list_active_models(&self) -> Result<Vec<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM models m JOIN providers p ON m.provider_id = p.id
             WHERE m.is_active = 1 AND p.is_active = 1",
            MODEL_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| model_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// 管理端模型列表；先把非自定义名称的 display_name 按提供商前缀重新同步
    pub async fn list_all_models(&self) -> Result<Vec<Model>> {
        let conn = self.connection.lock().await;
        conn.execute(
            "UPDATE models SET display_name =
                CASE
                    WHEN (SELECT COALESCE(model_prefix, '') FROM providers WHERE id = models.provider_id) != ''
                    THEN (SELECT model_prefix FROM providers WHERE id = models.provider_id) || '/' || original_id
                    ELSE original_id
                END
             WHERE custom_name = 0 OR custom_name IS NULL",
            [],
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM models m JOIN providers p ON m.provider_id = p.id",
            MODEL_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| model_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// 提供商前缀变更后，重算该提供商下所有非自定义名称模型的显示名
    pub async fn sync_display_names_for_provider(&self, provider_id: i64) -> Result<usize> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE models SET display_name =
                CASE
                    WHEN (SELECT COALESCE(model_prefix, '') FROM providers WHERE id = models.provider_id) != ''
                    THEN (SELECT model_prefix FROM providers WHERE id = models.provider_id) || '/' || original_id
                    ELSE original_id
                END
             WHERE provider_id = ?1 AND (custom_name = 0 OR custom_name IS NULL)",
            [provider_id],
        )?;
        Ok(affected)
    }

    pub async fn list_provider_models(&self, provider_id: i64) -> Result<Vec<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM models m JOIN providers p ON m.provider_id = p.id
             WHERE m.provider_id = ?1",
            MODEL_COLUMNS
        ))?;
        let rows = stmt.query_map([provider_id], |row| model_from_row(row))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn add_model(
        &self,
        provider_id: i64,
        original_id: &str,
        display_name: &str,
        is_active: bool,
    ) -> Result<i64> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO models (provider_id, original_id, display_name, is_active)
             VALUES (?1, ?2, ?3, ?4)",
            (provider_id, original_id, display_name, if is_active { 1 } else { 0 }),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn model_exists(&self, provider_id: i64, original_id: &str) -> Result<bool> {
        let conn = self.connection.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM models WHERE provider_id = ?1 AND original_id = ?2",
            (provider_id, original_id),
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// 设置自定义显示名（custom_name 置 1，不再随前缀同步）
    pub async fn set_model_display_name(&self, id: i64, display_name: &str) -> Result<bool> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE models SET display_name = ?1, custom_name = 1 WHERE id = ?2",
            (display_name, id),
        )?;
        Ok(affected > 0)
    }

    /// 恢复自动名称：provider 前缀 + original_id，custom_name 清零
    pub async fn reset_model_display_name(&self, id: i64) -> Result<Option<String>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT m.original_id, COALESCE(p.model_prefix, '')
             FROM models m JOIN providers p ON m.provider_id = p.id
             WHERE m.id = ?1",
        )?;
        let mut rows = stmt.query_map([id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let Some(pair) = rows.next() else {
            return Ok(None);
        };
        let (original_id, prefix) = pair?;
        drop(rows);
        drop(stmt);

        let display_name = if prefix.is_empty() {
            original_id
        } else {
            format!("{}/{}", prefix, original_id)
        };
        conn.execute(
            "UPDATE models SET display_name = ?1, custom_name = 0 WHERE id = ?2",
            (&display_name, id),
        )?;
        Ok(Some(display_name))
    }

    pub async fn set_model_active(&self, id: i64, is_active: bool) -> Result<bool> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE models SET is_active = ?1 WHERE id = ?2",
            (if is_active { 1 } else { 0 }, id),
        )?;
        Ok(affected > 0)
    }

    pub async fn set_models_active(&self, ids: &[i64], is_active: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.lock().await;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE models SET is_active = ? WHERE id IN ({})",
            placeholders
        );
        let active: i64 = if is_active { 1 } else { 0 };
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
        params.push(&active);
        for id in ids {
            params.push(id);
        }
        let affected = conn.execute(&sql, params.as_slice())?;
        Ok(affected)
    }

    pub async fn delete_model(&self, id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let affected = conn.execute("DELETE FROM models WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// 拉取上游模型列表后的整库同步：
    /// 已存在的按前缀刷新显示名，新模型以停用状态插入，下线的删除。
    /// 返回 (新增, 更新, 删除)。
    pub async fn sync_fetched_models(
        &self,
        provider_id: i64,
        model_prefix: &str,
        fetched_ids: &[String],
    ) -> Result<(usize, usize, usize)> {
        let conn = self.connection.lock().await;

        let mut existing = std::collections::HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT id, original_id FROM models WHERE provider_id = ?1")?;
            let rows = stmt.query_map([provider_id], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, i64>(0)?))
            })?;
            for r in rows {
                let (original_id, id) = r?;
                existing.insert(original_id, id);
            }
        }

        let mut added = 0;
        let mut updated = 0;
        let mut deleted = 0;
        let mut seen = std::collections::HashSet::new();

        for original_id in fetched_ids {
            if original_id.is_empty() {
                continue;
            }
            seen.insert(original_id.as_str());
            let display_name = if model_prefix.is_empty() {
                original_id.clone()
            } else {
                format!("{}/{}", model_prefix, original_id)
            };
            if let Some(id) = existing.get(original_id) {
                conn.execute(
                    "UPDATE models SET display_name = ?1 WHERE id = ?2 AND COALESCE(custom_name, 0) = 0",
                    (&display_name, id),
                )?;
                updated += 1;
            } else {
                conn.execute(
                    "INSERT INTO models (provider_id, original_id, display_name, is_active)
                     VALUES (?1, ?2, ?3, 0)",
                    (provider_id, original_id, &display_name),
                )?;
                added += 1;
            }
        }

        for (original_id, id) in &existing {
            if !seen.contains(original_id.as_str()) {
                conn.execute("DELETE FROM models WHERE id = ?1", [id])?;
                deleted += 1;
            }
        }

        Ok((added, updated, deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::providers::ProviderCreate;
    use crate::store::test_support::open_temp;

    async fn seed_provider(store: &Store, name: &str) -> i64 {
        store
            .create_provider(&ProviderCreate {
                name: name.to_string(),
                base_url: "https://api.example.com/v1".into(),
                api_key: "sk-test".into(),
                model_prefix: String::new(),
                provider_type: None,
                vertex_project: String::new(),
                vertex_location: String::new(),
                extra_headers: String::new(),
                proxy_url: String::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolve_prefers_display_name_then_original_then_stripped() {
        let (_dir, store) = open_temp().await;
        let pid = seed_provider(&store, "anthropic").await;
        store
            .add_model(pid, "claude-3-opus", "anthropic/claude-3-opus", true)
            .await
            .unwrap();

        // display_name 精确命中
        let (m, p) = store
            .resolve_model("anthropic/claude-3-opus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.original_id, "claude-3-opus");
        assert_eq!(p.name, "anthropic");

        // original_id 命中
        let (m, _) = store.resolve_model("claude-3-opus").await.unwrap().unwrap();
        assert_eq!(m.original_id, "claude-3-opus");

        // 去前缀后按 original_id 命中
        let (m, _) = store
            .resolve_model("openrouter/claude-3-opus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.original_id, "claude-3-opus");

        assert!(store.resolve_model("missing-model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_ignores_disabled_model_and_provider() {
        let (_dir, store) = open_temp().await;
        let pid = seed_provider(&store, "openai").await;
        let mid = store.add_model(pid, "gpt-4o", "gpt-4o", true).await.unwrap();

        assert!(store.resolve_model("gpt-4o").await.unwrap().is_some());

        store.set_model_active(mid, false).await.unwrap();
        assert!(store.resolve_model("gpt-4o").await.unwrap().is_none());

        store.set_model_active(mid, true).await.unwrap();
        store
            .update_provider(
                pid,
                &crate::store::providers::ProviderUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.resolve_model("gpt-4o").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_fetched_models_adds_updates_deletes() {
        let (_dir, store) = open_temp().await;
        let pid = seed_provider(&store, "openai").await;
        store.add_model(pid, "gpt-4o", "gpt-4o", true).await.unwrap();
        store.add_model(pid, "gone-model", "gone-model", true).await.unwrap();

        let fetched = vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()];
        let (added, updated, deleted) = store
            .sync_fetched_models(pid, "openai", &fetched)
            .await
            .unwrap();
        assert_eq!((added, updated, deleted), (1, 1, 1));

        let models = store.list_provider_models(pid).await.unwrap();
        assert_eq!(models.len(), 2);
        let mini = models.iter().find(|m| m.original_id == "gpt-4o-mini").unwrap();
        // 新拉取的模型默认停用，等待管理员启用
        assert!(!mini.is_active);
        assert_eq!(mini.display_name, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn custom_display_name_survives_sync() {
        let (_dir, store) = open_temp().await;
        let pid = seed_provider(&store, "openai").await;
        let mid = store.add_model(pid, "gpt-4o", "gpt-4o", true).await.unwrap();

        store.set_model_display_name(mid, "my-fast-model").await.unwrap();
        store
            .sync_fetched_models(pid, "openai", &["gpt-4o".to_string()])
            .await
            .unwrap();

        let models = store.list_provider_models(pid).await.unwrap();
        assert_eq!(models[0].display_name, "my-fast-model");
        assert!(models[0].custom_name);

        let reset = store.reset_model_display_name(mid).await.unwrap().unwrap();
        assert_eq!(reset, "gpt-4o");
    }
}
