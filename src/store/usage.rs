use serde::Serialize;

use super::Store;
use super::time;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SlotStat {
    /// HHMM 形式的槽位起点，如 1420 表示 14:20
    pub hour: u32,
    pub total_tokens: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStat {
    pub model_name: String,
    pub provider_name: String,
    pub total_tokens: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodStats {
    pub total_tokens: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub hourly_stats: Vec<SlotStat>,
    pub model_stats: Vec<ModelStat>,
}

impl Store {
    /// 每个完成的请求恰好追加一行
    pub async fn record_token_usage(
        &self,
        model_name: &str,
        provider_name: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        total_tokens: i64,
    ) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO token_usage (model_name, provider_name, prompt_tokens, completion_tokens, total_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (model_name, provider_name, prompt_tokens, completion_tokens, total_tokens),
        )?;
        Ok(())
    }

    /// 清理当前周期之前的全部记录；返回删除行数
    pub async fn clean_expired_usage(&self) -> Result<usize> {
        let period_start_utc = time::current_period_start().to_utc();
        let conn = self.connection.lock().await;
        let deleted = conn.execute(
            "DELETE FROM token_usage WHERE created_at < ?1",
            [time::to_utc_string(&period_start_utc)],
        )?;
        Ok(deleted)
    }

    /// 手动重置：删除当前周期内的记录
    pub async fn reset_current_period(&self) -> Result<usize> {
        let period_start_utc = time::current_period_start().to_utc();
        let conn = self.connection.lock().await;
        let deleted = conn.execute(
            "DELETE FROM token_usage WHERE created_at >= ?1",
            [time::to_utc_string(&period_start_utc)],
        )?;
        Ok(deleted)
    }

    /// 当前周期（北京时间 15:00 起）的聚合视图：
    /// 总量、以当前槽位为中心前后各 8 个的 20 分钟槽位序列、按模型分组。
    pub async fn period_stats(&self) -> Result<PeriodStats> {
        let now = time::beijing_now();
        let period_start_utc = time::current_period_start().to_utc();
        let period_start = time::to_utc_string(&period_start_utc);

        let conn = self.connection.lock().await;

        let (total_tokens, prompt_tokens, completion_tokens) = conn.query_row(
            "SELECT COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0)
             FROM token_usage WHERE created_at >= ?1",
            [&period_start],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        // 槽位编号 hour*3 + minute/20，一天 72 个
        let mut slot_map = std::collections::HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT CAST(strftime('%H', datetime(created_at, '+8 hours')) AS INTEGER),
                        CAST(strftime('%M', datetime(created_at, '+8 hours')) AS INTEGER) / 20,
                        COALESCE(SUM(total_tokens), 0),
                        COUNT(*)
                 FROM token_usage WHERE created_at >= ?1
                 GROUP BY 1, 2",
            )?;
            let rows = stmt.query_map([&period_start], |row| {
                let hour: i64 = row.get(0)?;
                let minute_slot: i64 = row.get(1)?;
                let tokens: i64 = row.get(2)?;
                let requests: i64 = row.get(3)?;
                Ok((hour * 3 + minute_slot, (tokens, requests)))
            })?;
            for r in rows {
                let (slot, data) = r?;
                slot_map.insert(slot, data);
            }
        }

        use chrono::Timelike;
        let current_slot = (now.hour() * 3 + now.minute() / 20) as i64;
        let mut hourly_stats = Vec::with_capacity(17);
        for s in (current_slot - 8)..=(current_slot + 8) {
            let slot = (s + 72) % 72;
            let (tokens, requests) = slot_map.get(&slot).copied().unwrap_or((0, 0));
            let hour = (slot / 3) as u32;
            let minute = ((slot % 3) * 20) as u32;
            hourly_stats.push(SlotStat {
                hour: hour * 100 + minute,
                total_tokens: tokens,
                request_count: requests,
            });
        }

        let mut model_stats = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT model_name, provider_name,
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(prompt_tokens), 0),
                        COALESCE(SUM(completion_tokens), 0),
                        COUNT(*)
                 FROM token_usage WHERE created_at >= ?1
                 GROUP BY model_name, provider_name
                 ORDER BY 3 DESC",
            )?;
            let rows = stmt.query_map([&period_start], |row| {
                Ok(ModelStat {
                    model_name: row.get(0)?,
                    provider_name: row.get(1)?,
                    total_tokens: row.get(2)?,
                    prompt_tokens: row.get(3)?,
                    completion_tokens: row.get(4)?,
                    request_count: row.get(5)?,
                })
            })?;
            for r in rows {
                model_stats.push(r?);
            }
        }

        Ok(PeriodStats {
            total_tokens,
            prompt_tokens,
            completion_tokens,
            hourly_stats,
            model_stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_temp;

    #[tokio::test]
    async fn usage_rows_accumulate_in_period_stats() {
        let (_dir, store) = open_temp().await;
        store
            .record_token_usage("gpt-4o", "openai", 5, 2, 7)
            .await
            .unwrap();
        store
            .record_token_usage("gpt-4o", "openai", 10, 4, 14)
            .await
            .unwrap();
        store
            .record_token_usage("claude-3-opus", "anthropic", 1, 1, 2)
            .await
            .unwrap();

        let stats = store.period_stats().await.unwrap();
        assert_eq!(stats.total_tokens, 23);
        assert_eq!(stats.prompt_tokens, 16);
        assert_eq!(stats.completion_tokens, 7);
        assert_eq!(stats.hourly_stats.len(), 17);
        assert_eq!(stats.model_stats.len(), 2);
        // 按总量降序
        assert_eq!(stats.model_stats[0].model_name, "gpt-4o");
        assert_eq!(stats.model_stats[0].request_count, 2);

        // 刚写入的记录落在当前槽位（序列中点）
        let current = &stats.hourly_stats[8];
        assert_eq!(current.request_count, 3);
        assert_eq!(current.total_tokens, 23);
    }

    #[tokio::test]
    async fn clean_expired_only_touches_old_rows() {
        let (_dir, store) = open_temp().await;
        store
            .record_token_usage("gpt-4o", "openai", 5, 2, 7)
            .await
            .unwrap();
        // 当前周期内的记录不受清理影响
        let deleted = store.clean_expired_usage().await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.period_stats().await.unwrap().total_tokens, 7);

        let deleted = store.reset_current_period().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.period_stats().await.unwrap().total_tokens, 0);
    }
}
