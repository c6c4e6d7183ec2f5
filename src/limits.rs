use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{GatewayError, Result};
use crate::store::Store;

/// 入口处的三道闸门：全局滑动窗口、按规则滑动窗口、全局并发。
/// 计数都只存内存，随进程生命周期存在；阈值每次检查时从存储读取，
/// 后台修改数秒内生效，无需重启。
pub struct Limits {
    store: Store,
    global_window: Mutex<Vec<Instant>>,
    rule_windows: Mutex<HashMap<String, Vec<Instant>>>,
    in_flight: Arc<AtomicI64>,
}

/// 并发名额的 RAII 凭据，析构时归还。
/// 流式响应应把凭据移进响应体流，保证读完/断开才释放。
#[derive(Debug)]
pub struct ConcurrencyPermit {
    in_flight: Arc<AtomicI64>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 滑动窗口判定：先驱逐过期项，超限拒绝，否则记录本次
fn window_admit(times: &mut Vec<Instant>, now: Instant, window: Duration, max_requests: usize) -> bool {
    times.retain(|t| now.duration_since(*t) < window);
    if times.len() >= max_requests {
        return false;
    }
    times.push(now);
    true
}

impl Limits {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            global_window: Mutex::new(Vec::new()),
            rule_windows: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicI64::new(0)),
        }
    }

    pub async fn check_global(&self) -> Result<()> {
        let cfg = self.store.rate_limit_config().await?;
        if !cfg.enabled {
            return Ok(());
        }
        let mut window = self
            .global_window
            .lock()
            .map_err(|_| GatewayError::Config("rate limit lock poisoned".into()))?;
        if window_admit(
            &mut window,
            Instant::now(),
            Duration::from_secs(cfg.window_seconds),
            cfg.max_requests,
        ) {
            Ok(())
        } else {
            Err(GatewayError::RateLimited)
        }
    }

    /// 自定义规则逐条独立判定：
    /// 同时指定提供商和模型的规则只匹配两者都相同的请求，
    /// 只指定一侧的规则匹配该侧；首个超限的规则即拒绝并带回规则名。
    pub async fn check_custom(&self, provider_id: i64, model_name: &str) -> Result<()> {
        let rules = self.store.custom_rate_limit_rules().await?;
        if rules.is_empty() {
            return Ok(());
        }

        let mut windows = self
            .rule_windows
            .lock()
            .map_err(|_| GatewayError::Config("rate limit lock poisoned".into()))?;
        let now = Instant::now();

        for rule in rules.iter().filter(|r| r.enabled) {
            let key = if rule.provider_id > 0 && !rule.model_name.is_empty() {
                if rule.provider_id != provider_id || rule.model_name != model_name {
                    continue;
                }
                format!("provider:{}:model:{}", provider_id, model_name)
            } else if rule.provider_id > 0 {
                if rule.provider_id != provider_id {
                    continue;
                }
                format!("provider:{}", provider_id)
            } else if !rule.model_name.is_empty() {
                if rule.model_name != model_name {
                    continue;
                }
                format!("model:{}", model_name)
            } else {
                continue;
            };

            let times = windows.entry(key).or_default();
            if !window_admit(times, now, Duration::from_secs(rule.window), rule.max_requests) {
                return Err(GatewayError::CustomRateLimited(rule.name.clone()));
            }
        }
        Ok(())
    }

    /// 并发闸门。检查-递增之间存在窗口，上限是软性的（允许轻微超冲），
    /// 换来无锁快路径；释放由凭据析构保证恰好一次。
    pub async fn acquire(&self) -> Result<ConcurrencyPermit> {
        let cfg = self.store.concurrency_config().await?;
        if cfg.enabled {
            let current = self.in_flight.load(Ordering::SeqCst);
            if current >= cfg.limit {
                return Err(GatewayError::ConcurrencyExceeded);
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencyPermit {
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn current_in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::settings::CustomRateLimitRule;
    use crate::store::test_support::open_temp;

    #[test]
    fn window_evicts_and_caps() {
        let mut times = Vec::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);

        for _ in 0..60 {
            assert!(window_admit(&mut times, start, window, 60));
        }
        // 第 61 个同窗请求被拒
        assert!(!window_admit(&mut times, start, window, 60));
        assert_eq!(times.len(), 60);

        // 窗口滑过后旧记录被驱逐
        let later = start + Duration::from_secs(61);
        assert!(window_admit(&mut times, later, window, 60));
        assert_eq!(times.len(), 1);
    }

    #[test]
    fn window_boundary_entry_is_evicted() {
        let mut times = Vec::new();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        assert!(window_admit(&mut times, start, window, 1));
        // 恰在边界上的记录视为过期
        assert!(window_admit(&mut times, start + window, window, 1));
    }

    #[tokio::test]
    async fn global_gate_disabled_by_default() {
        let (_dir, store) = open_temp().await;
        let limits = Limits::new(store);
        for _ in 0..100 {
            limits.check_global().await.unwrap();
        }
    }

    #[tokio::test]
    async fn global_gate_rejects_beyond_max() {
        let (_dir, store) = open_temp().await;
        store.set_setting("rate_limit_enabled", "true").await.unwrap();
        store.set_setting("rate_limit_max_requests", "3").await.unwrap();
        store.set_setting("rate_limit_window", "60").await.unwrap();

        let limits = Limits::new(store);
        for _ in 0..3 {
            limits.check_global().await.unwrap();
        }
        let err = limits.check_global().await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));
    }

    #[tokio::test]
    async fn custom_rules_match_by_specificity() {
        let (_dir, store) = open_temp().await;
        store
            .set_custom_rate_limit_rules(&[
                CustomRateLimitRule {
                    id: 1,
                    name: "opus-only".into(),
                    provider_id: 7,
                    model_name: "claude-3-opus".into(),
                    max_requests: 1,
                    window: 60,
                    enabled: true,
                },
                CustomRateLimitRule {
                    id: 2,
                    name: "provider-wide".into(),
                    provider_id: 7,
                    model_name: String::new(),
                    max_requests: 100,
                    window: 60,
                    enabled: true,
                },
            ])
            .await
            .unwrap();

        let limits = Limits::new(store);
        // 其他提供商不受影响
        limits.check_custom(8, "claude-3-opus").await.unwrap();
        limits.check_custom(8, "claude-3-opus").await.unwrap();

        limits.check_custom(7, "claude-3-opus").await.unwrap();
        let err = limits.check_custom(7, "claude-3-opus").await.unwrap_err();
        match err {
            GatewayError::CustomRateLimited(name) => assert_eq!(name, "opus-only"),
            other => panic!("unexpected error: {}", other),
        }

        // 同提供商其他模型只受 provider-wide 约束
        limits.check_custom(7, "claude-3-haiku").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_rules_are_ignored() {
        let (_dir, store) = open_temp().await;
        store
            .set_custom_rate_limit_rules(&[CustomRateLimitRule {
                id: 1,
                name: "off".into(),
                provider_id: 0,
                model_name: "gpt-4o".into(),
                max_requests: 0,
                window: 60,
                enabled: false,
            }])
            .await
            .unwrap();
        let limits = Limits::new(store);
        limits.check_custom(1, "gpt-4o").await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_permit_releases_on_drop() {
        let (_dir, store) = open_temp().await;
        store.set_setting("concurrency_enabled", "true").await.unwrap();
        store.set_setting("concurrency_limit", "2").await.unwrap();

        let limits = Limits::new(store);
        let p1 = limits.acquire().await.unwrap();
        let _p2 = limits.acquire().await.unwrap();
        assert_eq!(limits.current_in_flight(), 2);

        let err = limits.acquire().await.unwrap_err();
        assert!(matches!(err, GatewayError::ConcurrencyExceeded));

        drop(p1);
        assert_eq!(limits.current_in_flight(), 1);
        let _p3 = limits.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_unbounded_when_disabled() {
        let (_dir, store) = open_temp().await;
        let limits = Limits::new(store);
        let mut permits = Vec::new();
        for _ in 0..50 {
            permits.push(limits.acquire().await.unwrap());
        }
        assert_eq!(limits.current_in_flight(), 50);
        permits.clear();
        assert_eq!(limits.current_in_flight(), 0);
    }
}
