use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{GatewayError, Result};
use crate::store::Store;

/// 提供商维度的 API Key 轮询。
/// 游标只存内存，进程重启后从 0 开始（有意为之）。
pub struct KeyRotator {
    store: Store,
    indices: Mutex<HashMap<i64, usize>>,
}

impl KeyRotator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            indices: Mutex::new(HashMap::new()),
        }
    }

    /// 取下一把启用的密钥。密钥列表每次从存储读取，
    /// 游标推进在单把锁内完成；使用计数旁路更新，失败不影响选择。
    pub async fn next_key(&self, provider_id: i64) -> Result<String> {
        let keys = self.store.list_active_keys(provider_id).await?;
        if keys.is_empty() {
            return Err(GatewayError::ProviderUnavailable("no active api keys".into()));
        }

        let (key_id, api_key) = if keys.len() == 1 {
            keys[0].clone()
        } else {
            let mut indices = self
                .indices
                .lock()
                .map_err(|_| GatewayError::Config("rotator lock poisoned".into()))?;
            let cursor = indices.entry(provider_id).or_insert(0);
            // 密钥数量收缩后游标可能越界，归零
            let current = if *cursor >= keys.len() { 0 } else { *cursor };
            let selected = keys[current].clone();
            *cursor = (current + 1) % keys.len();
            selected
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.bump_key_usage(key_id).await {
                tracing::warn!(key_id, error = %e, "failed to update key usage stats");
            }
        });

        Ok(api_key)
    }
}
