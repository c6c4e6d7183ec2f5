use crate::store::Store;
use crate::store::time;

/// 启动每日清理任务：每个北京时间 15:00 删除上一周期的用量记录。
/// 循环内每次重新计算下一次触发点，时钟跳变也不会漏掉周期。
pub fn spawn_retention_task(store: Store) {
    tokio::spawn(async move {
        loop {
            let now = time::beijing_now();
            let next_reset = time::next_reset_after(now);
            let wait = (next_reset - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(60));
            tracing::info!(
                "下次 token 统计重置时间(北京时间): {}",
                next_reset.format("%Y-%m-%d %H:%M:%S")
            );
            tokio::time::sleep(wait).await;

            tracing::info!("执行每日 token 记录清理任务(北京时间15:00)");
            match store.clean_expired_usage().await {
                Ok(deleted) => tracing::info!(deleted, "token 记录清理完成"),
                Err(e) => tracing::error!("清理 token 记录失败: {}", e),
            }
        }
    });
}
